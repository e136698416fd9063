mod input_builder;

#[cfg(all(feature = "dashmap", feature = "redis"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "dashmap", feature = "redis"))))]
pub mod any;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod fixed_window;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod token_bucket;

pub use input_builder::{InputFunctionBuilder, InputFuture};
use std::future::Future;

use crate::HeaderCompatibleOutput;
use actix_web::rt::time::Instant;

/// Default interval of the garbage collector used by the in-memory backends.
#[cfg(feature = "dashmap")]
pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc), although many connection pools already do so internally; there is no
/// need to wrap it twice. Clones share their state, so a clone enforces the same quota.
pub trait Backend: Clone {
    type Error;

    /// Process an incoming request.
    ///
    /// Every evaluated call consumes one unit of quota for the key, whatever happens to the request
    /// afterwards; there is no way to give it back.
    ///
    /// Returns whether to allow or deny the request, together with the state of the key's quota.
    /// A denied request always reports zero remaining.
    fn request(
        &self,
        input: RateLimitInput,
    ) -> impl Future<Output = Result<(Decision, RateLimitOutput), Self::Error>>;
}

/// Input to a [Backend].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInput {
    /// The rate limit key to be used for this request.
    ///
    /// The key is not validated; an empty key is a single bucket shared by every caller using it.
    pub key: String,
    /// Point in time after which a backend performing I/O gives up and returns an error.
    ///
    /// In-memory backends never wait, so they ignore it.
    pub deadline: Option<Instant>,
}

impl RateLimitInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Output from a [Backend].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOutput {
    /// Total number of requests that are permitted within the window, or the bucket capacity.
    pub limit: u64,
    /// Number of requests that will be permitted until the limit resets.
    pub remaining: u64,
    /// Time at which the limit resets.
    ///
    /// For a fixed window this is the end of the current window. For a token bucket it is the time
    /// at which the bucket will be full again, or once it is empty, the arrival of the next token.
    pub reset: Instant,
}

impl HeaderCompatibleOutput for RateLimitOutput {
    fn limit(&self) -> u64 {
        self.limit
    }

    fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Seconds until the rate limit resets (rounded upwards, so that it is guaranteed to be reset
    /// after waiting for the duration).
    fn seconds_until_reset(&self) -> u64 {
        let millis = self
            .reset
            .saturating_duration_since(Instant::now())
            .as_millis() as f64;
        (millis / 1000f64).ceil() as u64
    }
}
