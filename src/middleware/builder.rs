use crate::backend::{Backend, RateLimitInput, RateLimitOutput};
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{ContentType, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Body of the default response to a denied request.
pub const DENIED_BODY: &str = "429 - Too Many Requests";

pub struct RateLimiterBuilder<BE, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
}

fn denied() -> HttpResponse {
    HttpResponse::TooManyRequests()
        .content_type(ContentType::plaintext())
        .body(DENIED_BODY)
}

fn insert_status_headers<O: HeaderCompatibleOutput>(map: &mut HeaderMap, status: &O) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.seconds_until_reset()),
    );
}

impl<BE, F, O> RateLimiterBuilder<BE, F>
where
    BE: Backend + 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<RateLimitInput, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_: &RateLimitOutput| denied()),
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false, in which case the backend error is turned into the response.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until the reset)
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, output: Option<&RateLimitOutput>| {
                if let Some(status) = output {
                    insert_status_headers(map, status);
                }
            },
        ));
        self.denied_response = Rc::new(|status: &RateLimitOutput| {
            let mut response = denied();
            let map = response.headers_mut();
            insert_status_headers(map, status);
            map.insert(RETRY_AFTER, HeaderValue::from(status.seconds_until_reset()));
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [RateLimitOutput] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&RateLimitOutput>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to status 429 with the plain text body `429 - Too Many Requests`.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&RateLimitOutput) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<BE, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
        }
    }
}

/// Rate limit state that can be reported in response headers, see
/// [RateLimiterBuilder::add_headers].
pub trait HeaderCompatibleOutput {
    /// Value for the `x-ratelimit-limit` header.
    fn limit(&self) -> u64;

    /// Value for the `x-ratelimit-remaining` header.
    fn remaining(&self) -> u64;

    /// Value for the `x-ratelimit-reset` and `retry-after` headers.
    ///
    /// This should be the number of seconds from now until the limit resets.\
    /// If the limit has already reset this should return 0.
    fn seconds_until_reset(&self) -> u64;
}
