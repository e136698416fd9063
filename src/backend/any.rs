use crate::backend::fixed_window::FixedWindowBackend;
use crate::backend::redis::{self, RedisBackend};
use crate::backend::token_bucket::TokenBucketBackend;
use crate::backend::{Backend, Decision, RateLimitInput, RateLimitOutput};
use crate::config::{Algorithm, Settings};
use crate::policy::PolicyError;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnyError {
    #[error("Invalid rate limit configuration: {0}")]
    Policy(
        #[source]
        #[from]
        PolicyError,
    ),
    #[error(transparent)]
    Redis(#[from] redis::Error),
}

impl ResponseError for AnyError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// One of the backends provided by this crate, chosen from [Settings] at startup.
#[derive(Clone)]
pub enum AnyBackend {
    FixedWindow(FixedWindowBackend),
    TokenBucket(TokenBucketBackend),
    Redis(RedisBackend),
}

impl AnyBackend {
    /// Build the backend named by `settings.rate_limit_algorithm`.
    ///
    /// Fails on an invalid limit, or when Redis is selected but cannot be reached.
    pub async fn from_settings(settings: &Settings) -> Result<Self, AnyError> {
        let backend = match settings.rate_limit_algorithm {
            Algorithm::FixedWindow => {
                let policy = settings.fixed_window_policy()?;
                Self::FixedWindow(FixedWindowBackend::builder(policy).build())
            }
            Algorithm::TokenBucket => {
                let policy = settings.token_bucket_policy()?;
                Self::TokenBucket(TokenBucketBackend::builder(policy).build())
            }
            Algorithm::Redis => {
                let policy = settings.fixed_window_policy()?;
                Self::Redis(RedisBackend::connect(&settings.redis(), policy).await?)
            }
        };
        log::info!(
            "Rate limiting with {:?}: {} requests per {}s",
            settings.rate_limit_algorithm,
            settings.rate_limit_requests,
            settings.rate_limit_window_seconds
        );
        Ok(backend)
    }
}

impl Backend for AnyBackend {
    type Error = AnyError;

    async fn request(
        &self,
        input: RateLimitInput,
    ) -> Result<(Decision, RateLimitOutput), Self::Error> {
        match self {
            Self::FixedWindow(backend) => Ok(backend.check(&input.key)),
            Self::TokenBucket(backend) => Ok(backend.check(&input.key)),
            Self::Redis(backend) => Ok(backend.request(input).await?),
        }
    }
}
