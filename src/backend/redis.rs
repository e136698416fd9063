use crate::backend::{Backend, Decision, RateLimitInput, RateLimitOutput};
use crate::policy::FixedWindowPolicy;
use actix_web::rt::time::{timeout, Instant};
use actix_web::{HttpResponse, ResponseError};
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, RedisResult};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default namespace for the rate limit counters.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";

/// Default time allowed for the store to answer the liveness probe when building a backend.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
    #[error("Redis is unavailable: {0}")]
    Unavailable(#[source] redis::RedisError),
    #[error("Redis did not respond within {0:?}")]
    PingTimeout(Duration),
    #[error("Redis did not respond before the request deadline")]
    Timeout,
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::InternalServerError().finish()
    }
}

/// The primitives the distributed backend needs from a shared store.
///
/// Implemented for the Redis [ConnectionManager]. Clones must talk to the same store.
pub trait CounterStore: Clone {
    /// Atomically increment the counter at `key` (creating it at 1 if absent), returning the new
    /// value along with the counter's remaining time to live, if it has one.
    fn increment(&self, key: &str) -> impl Future<Output = RedisResult<(u64, Option<Duration>)>>;

    /// Make the counter at `key` expire after `ttl`.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = RedisResult<()>>;

    /// Liveness probe.
    fn ping(&self) -> impl Future<Output = RedisResult<()>>;
}

impl CounterStore for ConnectionManager {
    async fn increment(&self, key: &str) -> RedisResult<(u64, Option<Duration>)> {
        let mut con = self.clone();
        // INCR is atomic on its own; PTTL only rides along in the same round trip.
        let (count, ttl): (u64, i64) = redis::pipe()
            .cmd("INCR")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut con)
            .await?;
        Ok((count, u64::try_from(ttl).ok().map(Duration::from_millis)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RedisResult<()> {
        let mut con = self.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> RedisResult<()> {
        let mut con = self.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

/// Where and how to reach the Redis server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// `host:port`, or a full `redis://` URL.
    pub address: String,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    /// Prepended to every rate limit key.
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            address: "localhost:6379".to_owned(),
            password: None,
            db: 0,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
        }
    }
}

/// A Fixed Window rate limiter [Backend] that stores its counters in Redis, so that every process
/// using the same Redis enforces one shared quota per key.
///
/// Each request is an `INCR` of the key's counter; the request that creates the counter (count
/// of 1) then sets its expiry to the window length, so the window is anchored to the first
/// request. The two calls are deliberately not atomic: should the expiry fail to be applied, the
/// counter lives on without a TTL, and two processes racing on a fresh window may shift its end
/// slightly. Store failures are returned to the caller, nothing is retried.
#[derive(Clone)]
pub struct RedisBackend<S = ConnectionManager> {
    store: S,
    policy: FixedWindowPolicy,
    key_prefix: String,
}

impl RedisBackend {
    /// Connect to Redis and build a backend, failing if it cannot be reached within
    /// [DEFAULT_PING_TIMEOUT].
    pub async fn connect(
        settings: &RedisSettings,
        policy: FixedWindowPolicy,
    ) -> Result<RedisBackend, Error> {
        let address = if settings.address.contains("://") {
            settings.address.clone()
        } else {
            format!("redis://{}", settings.address)
        };
        let mut info = address
            .as_str()
            .into_connection_info()
            .map_err(Error::Unavailable)?;
        info.redis.db = settings.db;
        info.redis.password = settings.password.clone();
        let client = redis::Client::open(info).map_err(Error::Unavailable)?;
        log::debug!(
            "Connecting to Redis at {} (db {})",
            settings.address,
            settings.db
        );
        let manager = timeout(DEFAULT_PING_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::PingTimeout(DEFAULT_PING_TIMEOUT))?
            .map_err(Error::Unavailable)?;
        RedisBackend::builder(manager, policy)
            .key_prefix(&settings.key_prefix)
            .build()
            .await
    }
}

impl<S: CounterStore> RedisBackend<S> {
    /// Create a RedisBackend Builder.
    ///
    /// # Arguments
    ///
    /// * `store`: Usually a [ConnectionManager].
    /// * `policy`: The limit enforced for every key.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_keyed_rate_limit::backend::redis::RedisBackend;
    /// # use actix_keyed_rate_limit::policy::FixedWindowPolicy;
    /// # use redis::aio::ConnectionManager;
    /// # use std::time::Duration;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let policy = FixedWindowPolicy::new(10, Duration::from_secs(1)).unwrap();
    /// let backend = RedisBackend::builder(manager, policy).build().await.unwrap();
    /// # };
    /// ```
    pub fn builder(store: S, policy: FixedWindowPolicy) -> Builder<S> {
        Builder {
            store,
            policy,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn policy(&self) -> FixedWindowPolicy {
        self.policy
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

pub struct Builder<S> {
    store: S,
    policy: FixedWindowPolicy,
    key_prefix: String,
    ping_timeout: Duration,
}

impl<S: CounterStore> Builder<S> {
    /// Prefix applied to all rate limit keys given to this backend, defaults to `rl:`.
    ///
    /// The prefix is used as a 'namespace' to avoid collision with other keys inside Redis.
    pub fn key_prefix(mut self, key_prefix: &str) -> Self {
        self.key_prefix = key_prefix.to_owned();
        self
    }

    /// How long the store has to answer the liveness probe made by [Builder::build].
    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Probe the store and build the backend.
    ///
    /// Fails if the store can't be reached, rather than producing a limiter that would error on
    /// every request.
    pub async fn build(self) -> Result<RedisBackend<S>, Error> {
        match timeout(self.ping_timeout, self.store.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Unavailable(e)),
            Err(_) => return Err(Error::PingTimeout(self.ping_timeout)),
        }
        Ok(RedisBackend {
            store: self.store,
            policy: self.policy,
            key_prefix: self.key_prefix,
        })
    }
}

/// Run a store call, giving up once `deadline` has passed.
async fn until<T>(
    deadline: Option<Instant>,
    call: impl Future<Output = RedisResult<T>>,
) -> Result<T, Error> {
    match deadline {
        None => Ok(call.await?),
        Some(deadline) => {
            let budget = deadline.saturating_duration_since(Instant::now());
            Ok(timeout(budget, call).await.map_err(|_| Error::Timeout)??)
        }
    }
}

impl<S: CounterStore> Backend for RedisBackend<S> {
    type Error = Error;

    async fn request(
        &self,
        input: RateLimitInput,
    ) -> Result<(Decision, RateLimitOutput), Self::Error> {
        let key = self.make_key(&input.key);
        let capacity = self.policy.capacity();
        let window = self.policy.window();

        let (count, ttl) = until(input.deadline, self.store.increment(&key)).await?;
        let now = Instant::now();
        let reset = if count == 1 {
            // This request opened the window
            until(input.deadline, self.store.expire(&key, window)).await?;
            now + window
        } else {
            if ttl.is_none() {
                // Left behind by a failed PEXPIRE, the counter never resets on its own
                log::warn!("Rate limit counter {key} has no expiry");
            }
            ttl.and_then(|ttl| now.checked_add(ttl)).unwrap_or(now + window)
        };

        let allow = count <= capacity;
        let output = RateLimitOutput {
            limit: capacity,
            remaining: capacity.saturating_sub(count),
            reset,
        };
        Ok((Decision::from_allowed(allow), output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MAX_WINDOW;
    use parking_lot::Mutex;
    use redis::{ErrorKind, RedisError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const SECOND: Duration = Duration::from_secs(1);
    const MINUTE: Duration = Duration::from_secs(60);

    /// Counters shared by every clone, expiring on the (pausable) tokio clock.
    #[derive(Clone, Default)]
    struct MemoryStore {
        entries: Arc<Mutex<HashMap<String, (u64, Option<Instant>)>>>,
        expire_calls: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
        failing_expire: Arc<AtomicBool>,
        latency: Option<Duration>,
    }

    impl MemoryStore {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency: Some(latency),
                ..Default::default()
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn set_failing_expire(&self, failing: bool) {
            self.failing_expire.store(failing, Ordering::SeqCst);
        }

        fn contains(&self, key: &str) -> bool {
            self.entries.lock().contains_key(key)
        }

        fn get(&self, key: &str) -> Option<(u64, Option<Instant>)> {
            self.entries.lock().get(key).copied()
        }

        async fn call(&self) -> RedisResult<()> {
            if let Some(latency) = self.latency {
                actix_web::rt::time::sleep(latency).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(RedisError::from((ErrorKind::IoError, "connection refused")));
            }
            Ok(())
        }
    }

    impl CounterStore for MemoryStore {
        async fn increment(&self, key: &str) -> RedisResult<(u64, Option<Duration>)> {
            self.call().await?;
            let now = Instant::now();
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.to_owned()).or_insert((0, None));
            if matches!(entry.1, Some(expiry) if expiry <= now) {
                *entry = (0, None);
            }
            entry.0 += 1;
            Ok((entry.0, entry.1.map(|expiry| expiry - now)))
        }

        async fn expire(&self, key: &str, ttl: Duration) -> RedisResult<()> {
            self.call().await?;
            if self.failing_expire.load(Ordering::SeqCst) {
                return Err(RedisError::from((ErrorKind::IoError, "connection reset")));
            }
            self.expire_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(entry) = self.entries.lock().get_mut(key) {
                entry.1 = Some(Instant::now() + ttl);
            }
            Ok(())
        }

        async fn ping(&self) -> RedisResult<()> {
            self.call().await
        }
    }

    async fn make_backend(store: MemoryStore, capacity: u64) -> RedisBackend<MemoryStore> {
        let policy = FixedWindowPolicy::new(capacity, MINUTE).unwrap();
        RedisBackend::builder(store, policy).build().await.unwrap()
    }

    #[actix_web::test]
    async fn test_allow_deny() {
        tokio::time::pause();
        let backend = make_backend(MemoryStore::default(), 5).await;
        for i in (0..5).rev() {
            let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
            assert!(decision.is_allowed());
            assert_eq!(output.remaining, i);
            assert_eq!(output.limit, 5);
        }
        let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(output.remaining, 0);
    }

    #[actix_web::test]
    async fn test_expiry_set_once_per_window() {
        tokio::time::pause();
        let store = MemoryStore::default();
        let backend = make_backend(store.clone(), 2).await;
        let start = Instant::now();
        for _ in 0..4 {
            let (_, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
            // The window end is fixed by the first request
            assert_eq!(output.reset, start + MINUTE);
            tokio::time::advance(SECOND).await;
        }
        assert_eq!(store.expire_calls.load(Ordering::SeqCst), 1);

        // Once the counter has expired a new window opens, with a new expiry
        tokio::time::advance(MINUTE).await;
        let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 1);
        assert_eq!(store.expire_calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn test_shared_quota() {
        tokio::time::pause();
        let store = MemoryStore::default();
        // Two processes pointed at the same store
        let a = make_backend(store.clone(), 5).await;
        let b = make_backend(store, 5).await;
        let mut allowed = 0;
        for backend in [&a, &a, &a, &b, &b, &b] {
            let (decision, _) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
            if decision.is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[actix_web::test]
    async fn test_key_prefix() {
        let store = MemoryStore::default();
        let backend = make_backend(store.clone(), 5).await;
        backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(store.contains("rl:KEY1"));

        let policy = FixedWindowPolicy::new(5, MINUTE).unwrap();
        let backend = RedisBackend::builder(store.clone(), policy)
            .key_prefix("prefix:")
            .build()
            .await
            .unwrap();
        backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(store.contains("prefix:KEY1"));
    }

    #[actix_web::test]
    async fn test_store_error_is_returned() {
        let store = MemoryStore::default();
        let backend = make_backend(store.clone(), 5).await;
        store.set_failing(true);
        let result = backend.request(RateLimitInput::new("KEY1")).await;
        assert!(matches!(result, Err(Error::Redis(_))));
        // Nothing was counted while the store was down
        store.set_failing(false);
        let (_, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert_eq!(output.remaining, 4);
    }

    #[actix_web::test]
    async fn test_expire_error_is_returned() {
        tokio::time::pause();
        let store = MemoryStore::default();
        let backend = make_backend(store.clone(), 5).await;
        store.set_failing_expire(true);
        let result = backend.request(RateLimitInput::new("KEY1")).await;
        assert!(matches!(result, Err(Error::Redis(_))));
        // The increment went through, the counter is left without an expiry
        assert_eq!(store.get("rl:KEY1"), Some((1, None)));

        // Later requests keep counting against the stranded counter
        store.set_failing_expire(false);
        let start = Instant::now();
        let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.remaining, 3);
        assert_eq!(output.reset, start + MINUTE);
        assert_eq!(store.get("rl:KEY1"), Some((2, None)));
        assert_eq!(store.expire_calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_longest_window() {
        tokio::time::pause();
        let store = MemoryStore::default();
        let policy = FixedWindowPolicy::new(1, MAX_WINDOW).unwrap();
        let backend = RedisBackend::builder(store, policy).build().await.unwrap();
        let start = Instant::now();
        let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.reset, start + MAX_WINDOW);
        let (decision, output) = backend.request(RateLimitInput::new("KEY1")).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(output.reset, start + MAX_WINDOW);
    }

    #[actix_web::test]
    async fn test_deadline() {
        tokio::time::pause();
        let store = MemoryStore::with_latency(Duration::from_millis(10));
        let backend = make_backend(store.clone(), 5).await;
        let input = RateLimitInput::new("KEY1").with_deadline(Instant::now() + SECOND);
        assert!(backend.request(input).await.unwrap().0.is_allowed());

        let slow = MemoryStore::with_latency(SECOND * 10);
        let backend = RedisBackend::builder(slow, FixedWindowPolicy::new(5, MINUTE).unwrap())
            .ping_timeout(SECOND * 30)
            .build()
            .await
            .unwrap();
        let input = RateLimitInput::new("KEY1").with_deadline(Instant::now() + SECOND);
        assert!(matches!(backend.request(input).await, Err(Error::Timeout)));
    }

    #[actix_web::test]
    async fn test_build_fails_fast() {
        tokio::time::pause();
        let policy = FixedWindowPolicy::new(5, MINUTE).unwrap();

        let store = MemoryStore::default();
        store.set_failing(true);
        let result = RedisBackend::builder(store, policy).build().await;
        assert!(matches!(result, Err(Error::Unavailable(_))));

        let store = MemoryStore::with_latency(MINUTE);
        let result = RedisBackend::builder(store, policy).build().await;
        assert!(matches!(result, Err(Error::PingTimeout(t)) if t == DEFAULT_PING_TIMEOUT));
    }

    // The tests below need a Redis server at REDIS_HOST:REDIS_PORT (default 127.0.0.1:6379).
    // Each test must use non-overlapping keys (because the tests may be run concurrently)
    // Each test should also reset its key on each run, so that it is in a clean state.
    async fn make_live_backend(
        clear_test_key: &str,
        capacity: u64,
        window: Duration,
    ) -> RedisBackend {
        let host = option_env!("REDIS_HOST").unwrap_or("127.0.0.1");
        let port = option_env!("REDIS_PORT").unwrap_or("6379");
        let settings = RedisSettings {
            address: format!("{host}:{port}"),
            ..Default::default()
        };
        let policy = FixedWindowPolicy::new(capacity, window).unwrap();
        let backend = RedisBackend::connect(&settings, policy).await.unwrap();
        let mut con = backend.store.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(format!("{DEFAULT_KEY_PREFIX}{clear_test_key}"))
            .query_async(&mut con)
            .await
            .unwrap();
        backend
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_live_allow_deny() {
        let backend = make_live_backend("test_live_allow_deny", 5, MINUTE).await;
        for i in (0..5).rev() {
            let (decision, output) = backend
                .request(RateLimitInput::new("test_live_allow_deny"))
                .await
                .unwrap();
            assert!(decision.is_allowed());
            assert_eq!(output.remaining, i);
        }
        let (decision, _) = backend
            .request(RateLimitInput::new("test_live_allow_deny"))
            .await
            .unwrap();
        assert!(decision.is_denied());
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_live_reset() {
        let backend = make_live_backend("test_live_reset", 1, SECOND).await;
        let input = RateLimitInput::new("test_live_reset");
        assert!(backend.request(input.clone()).await.unwrap().0.is_allowed());
        assert!(backend.request(input.clone()).await.unwrap().0.is_denied());
        actix_web::rt::time::sleep(SECOND + Duration::from_millis(100)).await;
        assert!(backend.request(input).await.unwrap().0.is_allowed());
    }

    #[actix_web::test]
    #[ignore = "requires a running Redis server"]
    async fn test_live_shared_quota() {
        let a = make_live_backend("test_live_shared_quota", 5, MINUTE).await;
        let b = make_live_backend("test_live_shared_quota", 5, MINUTE).await;
        let mut allowed = 0;
        for backend in [&a, &a, &a, &b, &b, &b] {
            let (decision, _) = backend
                .request(RateLimitInput::new("test_live_shared_quota"))
                .await
                .unwrap();
            if decision.is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[actix_web::test]
    async fn test_connect_unreachable() {
        // Nothing listens on port 1
        let settings = RedisSettings {
            address: "127.0.0.1:1".to_owned(),
            ..Default::default()
        };
        let result =
            RedisBackend::connect(&settings, FixedWindowPolicy::new(5, MINUTE).unwrap()).await;
        assert!(matches!(
            result,
            Err(Error::Unavailable(_)) | Err(Error::PingTimeout(_))
        ));
    }
}
