pub mod builder;

use crate::backend::{Backend, RateLimitInput, RateLimitOutput};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::{HttpMessage, HttpResponse};
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&RateLimitOutput>);
type DeniedResponse = dyn Fn(&RateLimitOutput) -> HttpResponse;

/// Rate limiting state of a request that was let through, stored in the request extensions.
///
/// Handlers can read it with `web::ReqData<RateLimitStatus>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Always false for requests reaching a handler, denied requests never get that far.
    pub rate_limited: bool,
    /// The backend's output, [None] if the backend failed and the limiter is failing open.
    pub output: Option<RateLimitOutput>,
}

/// Rate limit middleware.
pub struct RateLimiter<BA, F> {
    backend: BA,
    input_fn: Rc<F>,
    fail_open: bool,
    allowed_mutation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<BA, F, O> Clone for RateLimiter<BA, F>
where
    BA: Backend + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            input_fn: self.input_fn.clone(),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
        }
    }
}

impl<BA, F, O> RateLimiter<BA, F>
where
    BA: Backend + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `input_fn`: A future that produces input to the backend based on the incoming request.
    pub fn builder(backend: BA, input_fn: F) -> RateLimiterBuilder<BA, F> {
        RateLimiterBuilder::new(backend, input_fn)
    }
}

impl<S, B, BA, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<Error = BE> + 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            backend: self.backend.clone(),
            input_fn: Rc::clone(&self.input_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_mutation.clone(),
            denied_response: self.denied_response.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, F> {
    service: Rc<RefCell<S>>,
    backend: BA,
    input_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

impl<S, B, BA, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<Error = BE> + 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let backend = self.backend.clone();
        let input_fn = self.input_fn.clone();
        let fail_open = self.fail_open;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();

        Box::pin(async move {
            let input = match (input_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Rate limiter input function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };
            let key = input.key.clone();

            let output = match backend.request(input).await {
                // Able to successfully query rate limiter backend
                Ok((decision, output)) => {
                    if decision.is_denied() {
                        log::info!("Rate limit exceeded for key: {key}");
                        let response: HttpResponse = (denied_response)(&output);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    Some(output)
                }
                // Unable to query rate limiter backend
                Err(e) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {}, allowing the request anyway", e);
                        None
                    } else {
                        log::error!("Rate limiter failed: {}", e);
                        return Ok(req
                            .into_response(e.into().error_response())
                            .map_into_right_body());
                    }
                }
            };

            req.extensions_mut().insert(RateLimitStatus {
                rate_limited: false,
                output: output.clone(),
            });

            let mut service_response = service.call(req).await?;

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), output.as_ref());
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
