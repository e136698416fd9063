//! Settings read from the process environment.

use crate::policy::{FixedWindowPolicy, PolicyError, TokenBucketPolicy};
use config::{Config, ConfigBuilder, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Which [Backend](crate::backend::Backend) enforces the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// In-memory fixed window, per process.
    FixedWindow,
    /// In-memory token bucket, per process.
    TokenBucket,
    /// Fixed window shared through Redis.
    Redis,
}

/// Server and rate limiter settings.
///
/// Every field maps to the upper-cased environment variable of the same name, e.g.
/// `RATE_LIMIT_REQUESTS=100`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub port: u16,
    pub rate_limit_algorithm: Algorithm,
    /// Requests allowed per window, also the token bucket capacity.
    pub rate_limit_requests: u64,
    pub rate_limit_window_seconds: u64,
    /// Token bucket refill rate, defaults to one full bucket per window.
    pub rate_limit_refill_per_second: Option<f64>,
    /// Let requests through when the limiter itself fails.
    pub rate_limit_fail_open: bool,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub redis_key_prefix: String,
}

impl Settings {
    /// Load the settings from environment variables, falling back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Config::builder().add_source(Environment::default().try_parsing(true)))
    }

    /// Apply the defaults beneath the sources of `builder`, then deserialize.
    pub fn load(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let mut settings: Settings = builder
            .set_default("port", 8080)?
            .set_default("rate_limit_algorithm", "token_bucket")?
            .set_default("rate_limit_requests", 10)?
            .set_default("rate_limit_window_seconds", 1)?
            .set_default("rate_limit_fail_open", false)?
            .set_default("redis_addr", "localhost:6379")?
            .set_default("redis_db", 0)?
            .set_default("redis_key_prefix", "rl:")?
            .build()?
            .try_deserialize()?;
        // An empty REDIS_PASSWORD means no password
        settings.redis_password = settings.redis_password.filter(|p| !p.is_empty());
        Ok(settings)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub fn fixed_window_policy(&self) -> Result<FixedWindowPolicy, PolicyError> {
        FixedWindowPolicy::new(self.rate_limit_requests, self.window())
    }

    pub fn token_bucket_policy(&self) -> Result<TokenBucketPolicy, PolicyError> {
        match self.rate_limit_refill_per_second {
            Some(rate) => TokenBucketPolicy::new(self.rate_limit_requests, rate),
            None => TokenBucketPolicy::per_window(self.rate_limit_requests, self.window()),
        }
    }

    #[cfg(feature = "redis")]
    pub fn redis(&self) -> crate::backend::redis::RedisSettings {
        crate::backend::redis::RedisSettings {
            address: self.redis_addr.clone(),
            password: self.redis_password.clone(),
            db: self.redis_db,
            key_prefix: self.redis_key_prefix.clone(),
        }
    }
}
