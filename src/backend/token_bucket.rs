use crate::backend::{
    Backend, Decision, RateLimitInput, RateLimitOutput, DEFAULT_GC_INTERVAL_SECONDS,
};
use crate::policy::TokenBucketPolicy;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// A Token Bucket rate limiter [Backend] that keeps one bucket per key in memory.
///
/// Buckets start full and refill continuously; the refill is computed lazily whenever a key is
/// seen, so no timer is needed per bucket. Bursts of up to `capacity` requests are allowed,
/// after which requests are admitted at the refill rate. State is local to the process.
#[derive(Clone)]
pub struct TokenBucketBackend {
    inner: Arc<Inner>,
}

struct Inner {
    policy: TokenBucketPolicy,
    map: Arc<DashMap<String, Mutex<Bucket>>>,
    gc_handle: Option<JoinHandle<()>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(policy: &TokenBucketPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.capacity() as f64,
            last_refill: now,
        }
    }

    /// Add the tokens accumulated since the last refill, capped at the capacity.
    fn refill(&mut self, policy: &TokenBucketPolicy, now: Instant) {
        // Instants are monotonic, a clock going backwards would only ever give zero here.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * policy.refill_rate_per_second())
            .min(policy.capacity() as f64);
        self.last_refill = now;
    }

    /// Whether the bucket would be full at `now`, which makes it indistinguishable from a new one.
    fn idle(&self, policy: &TokenBucketPolicy, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * policy.refill_rate_per_second() >= policy.capacity() as f64
    }
}

impl TokenBucketBackend {
    pub fn builder(policy: TokenBucketPolicy) -> TokenBucketBackendBuilder {
        TokenBucketBackendBuilder {
            policy,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    pub fn policy(&self) -> TokenBucketPolicy {
        self.inner.policy
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    /// Take a token from `key`'s bucket if one is available.
    pub fn check(&self, key: &str) -> (Decision, RateLimitOutput) {
        let now = Instant::now();
        let policy = &self.inner.policy;
        if let Some(bucket) = self.inner.map.get(key) {
            return self.take(&mut bucket.lock(), now);
        }
        let bucket = self
            .inner
            .map
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(Bucket::full(policy, now)));
        let result = self.take(&mut bucket.lock(), now);
        result
    }

    fn take(&self, bucket: &mut Bucket, now: Instant) -> (Decision, RateLimitOutput) {
        let policy = &self.inner.policy;
        let capacity = policy.capacity();
        bucket.refill(policy, now);
        if bucket.tokens >= 1f64 {
            bucket.tokens -= 1f64;
            let output = RateLimitOutput {
                limit: capacity,
                remaining: bucket.tokens.floor() as u64,
                reset: now + policy.time_to_refill(capacity as f64 - bucket.tokens),
            };
            (Decision::Allowed, output)
        } else {
            let output = RateLimitOutput {
                limit: capacity,
                remaining: 0,
                reset: now + policy.time_to_refill(1f64 - bucket.tokens),
            };
            (Decision::Denied, output)
        }
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Mutex<Bucket>>>,
        policy: TokenBucketPolicy,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(interval.as_secs_f64() > 0f64, "GC interval must be non-zero");
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| !v.get_mut().idle(&policy, now));
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl Backend for TokenBucketBackend {
    type Error = Infallible;

    async fn request(
        &self,
        input: RateLimitInput,
    ) -> Result<(Decision, RateLimitOutput), Self::Error> {
        Ok(self.check(&input.key))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = &self.gc_handle {
            handle.abort();
        }
    }
}

pub struct TokenBucketBackendBuilder {
    policy: TokenBucketPolicy,
    gc_interval: Option<Duration>,
}

impl TokenBucketBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically removes buckets that have refilled completely, since a
    /// full bucket behaves exactly like one that was never created.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> TokenBucketBackend {
        let map = Arc::new(DashMap::<String, Mutex<Bucket>>::new());
        let policy = self.policy;
        let gc_handle = self.gc_interval.map(|gc_interval| {
            TokenBucketBackend::garbage_collector(map.clone(), policy, gc_interval)
        });
        TokenBucketBackend {
            inner: Arc::new(Inner {
                policy,
                map,
                gc_handle,
            }),
        }
    }
}
