use std::time::Duration;
use thiserror::Error;

/// Longest window, and longest time for an empty bucket to refill, that a policy accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Rejected limit configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Capacity must be greater than zero")]
    ZeroCapacity,
    #[error("Window duration must be greater than zero")]
    ZeroWindow,
    #[error("Window duration must not exceed {:?} (got {0:?})", MAX_WINDOW)]
    WindowTooLong(Duration),
    #[error("Refill rate must be a positive, finite number of tokens per second (got {0})")]
    InvalidRefillRate(f64),
    #[error("Refill rate {0} is too slow, an empty bucket must refill within {:?}", MAX_WINDOW)]
    RefillTooSlow(f64),
}

/// Limit applied by a fixed window backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowPolicy {
    capacity: u64,
    window: Duration,
}

impl FixedWindowPolicy {
    /// # Arguments
    ///
    /// * `capacity`: The total requests to be allowed within the window.
    /// * `window`: The rate limiting interval, anchored to the first request of each window.
    pub fn new(capacity: u64, window: Duration) -> Result<Self, PolicyError> {
        if capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        if window > MAX_WINDOW {
            return Err(PolicyError::WindowTooLong(window));
        }
        Ok(Self { capacity, window })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Limit applied by a token bucket backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketPolicy {
    capacity: u64,
    refill_rate: f64,
}

impl TokenBucketPolicy {
    /// # Arguments
    ///
    /// * `capacity`: The size of each bucket; buckets start full.
    /// * `refill_rate_per_second`: Tokens added back to a bucket per second.
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Result<Self, PolicyError> {
        if capacity == 0 {
            return Err(PolicyError::ZeroCapacity);
        }
        if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0f64 {
            return Err(PolicyError::InvalidRefillRate(refill_rate_per_second));
        }
        // Bounds every reset time the backend can compute from this policy
        if capacity as f64 / refill_rate_per_second > MAX_WINDOW.as_secs_f64() {
            return Err(PolicyError::RefillTooSlow(refill_rate_per_second));
        }
        Ok(Self {
            capacity,
            refill_rate: refill_rate_per_second,
        })
    }

    /// A bucket that refills completely once per `window`.
    pub fn per_window(capacity: u64, window: Duration) -> Result<Self, PolicyError> {
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        if window > MAX_WINDOW {
            return Err(PolicyError::WindowTooLong(window));
        }
        Self::new(capacity, capacity as f64 / window.as_secs_f64())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate
    }

    /// Time taken to refill `tokens` tokens.
    pub(crate) fn time_to_refill(&self, tokens: f64) -> Duration {
        Duration::try_from_secs_f64((tokens / self.refill_rate).max(0f64))
            .unwrap_or(MAX_WINDOW)
    }
}
