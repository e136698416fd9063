use crate::backend::{
    Backend, Decision, RateLimitInput, RateLimitOutput, DEFAULT_GC_INTERVAL_SECONDS,
};
use crate::policy::FixedWindowPolicy;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// A Fixed Window rate limiter [Backend] that uses [Dashmap](dashmap::DashMap) to store keys
/// in memory.
///
/// Each key's window starts at that key's first request, windows of different keys are not
/// aligned. State is local to the process.
#[derive(Clone)]
pub struct FixedWindowBackend {
    inner: Arc<Inner>,
}

struct Inner {
    policy: FixedWindowPolicy,
    map: Arc<DashMap<String, Mutex<Window>>>,
    gc_handle: Option<JoinHandle<()>>,
}

struct Window {
    start: Instant,
    count: u64,
}

impl Window {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.start) >= window
    }
}

impl FixedWindowBackend {
    pub fn builder(policy: FixedWindowPolicy) -> FixedWindowBackendBuilder {
        FixedWindowBackendBuilder {
            policy,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    pub fn policy(&self) -> FixedWindowPolicy {
        self.inner.policy
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    /// Count a request against `key` and decide whether it may proceed.
    pub fn check(&self, key: &str) -> (Decision, RateLimitOutput) {
        let now = Instant::now();
        // Existing keys only need a shard read lock, the per-key mutex serialises the update.
        if let Some(window) = self.inner.map.get(key) {
            return self.count(&mut window.lock(), now);
        }
        let window = self
            .inner
            .map
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(Window { start: now, count: 0 }));
        let result = self.count(&mut window.lock(), now);
        result
    }

    fn count(&self, window: &mut Window, now: Instant) -> (Decision, RateLimitOutput) {
        let capacity = self.inner.policy.capacity();
        let length = self.inner.policy.window();
        if window.count == 0 || window.expired(now, length) {
            // A fresh key, or the previous window is over: start a new one at this request.
            window.start = now;
            window.count = 1;
        } else if window.count >= capacity {
            return (
                Decision::Denied,
                RateLimitOutput {
                    limit: capacity,
                    remaining: 0,
                    reset: window.start + length,
                },
            );
        } else {
            window.count += 1;
        }
        (
            Decision::Allowed,
            RateLimitOutput {
                limit: capacity,
                remaining: capacity - window.count,
                reset: window.start + length,
            },
        )
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Mutex<Window>>>,
        window: Duration,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(interval.as_secs_f64() > 0f64, "GC interval must be non-zero");
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                let before = map.len();
                map.retain(|_k, v| !v.get_mut().expired(now, window));
                log::trace!(
                    "Fixed window GC removed {} expired keys",
                    before.saturating_sub(map.len())
                );
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl Backend for FixedWindowBackend {
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

pub struct FixedWindowBackendBuilder {
    policy: FixedWindowPolicy,
    gc_interval: Option<Duration>,
}

impl FixedWindowBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing keys whose window is
    /// over. It is spawned on the current actix/tokio runtime when the backend is built.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> FixedWindowBackend {
        let map = Arc::new(DashMap::<String, Mutex<Window>>::new());
        let window = self.policy.window();
        let gc_handle = self.gc_interval.map(|gc_interval| {
            FixedWindowBackend::garbage_collector(map.clone(), window, gc_interval)
        });
        FixedWindowBackend {
            inner: Arc::new(Inner {
                policy: self.policy,
                map,
                gc_handle,
            }),
        }
    }
}
