//! Cache-aside fetching across the local and remote tiers

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use broker_clock::{Clock, System};
use serde::{de::DeserializeOwned, Serialize};

use crate::{CacheError, DistributedLock, LocalCache, LockError, RemoteCache};

/// A value that can be computed on a cache miss
///
/// Implementations describe one fetch: the key it is cached under, how long
/// a computed value may live in each tier, and how to compute it.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// The value produced
    type Value: Serialize + DeserializeOwned + Send + Sync;

    /// The error returned when computing fails or the lock cannot be acquired
    type Error: From<CacheError> + From<LockError> + Send;

    /// A key derived deterministically from this fetch's parameters
    fn cache_key(&self) -> String;

    /// How long `value` may be served from the local tier
    fn local_ttl(&self, value: &Self::Value) -> Duration;

    /// How long `value` may be served from the remote tier
    ///
    /// This should exceed the local TTL.
    fn remote_ttl(&self, value: &Self::Value) -> Duration;

    /// Produces the value from its source of truth
    async fn compute(&self) -> Result<Self::Value, Self::Error>;
}

/// Stampede-safe cache-aside fetching
///
/// A fetch checks the local tier, then the remote tier, and only on a miss in
/// both takes the named distributed lock `<key>_lock`. Once the lock is held
/// the remote tier is checked again, since another replica may have filled it
/// while this one waited. Only then is the value computed and written to the
/// remote tier. Across the fleet, at most one computation per key runs within
/// the remote tier's freshness window.
///
/// Failed computations are never cached. Remote tier read or write failures
/// degrade to misses; lock failures are returned to the caller.
pub struct CacheAside<C = System> {
    local: Arc<LocalCache<C>>,
    remote: Arc<dyn RemoteCache>,
    lock: DistributedLock<C>,
}

impl<C> CacheAside<C> {
    /// Constructs a fetcher over the given tiers
    pub fn new(
        local: Arc<LocalCache<C>>,
        remote: Arc<dyn RemoteCache>,
        lock: DistributedLock<C>,
    ) -> Self {
        Self {
            local,
            remote,
            lock,
        }
    }

    /// The local tier
    pub fn local(&self) -> &LocalCache<C> {
        &self.local
    }
}

impl<C: Clock + Send + Sync> CacheAside<C> {
    /// Returns the cached value for `fetch`, computing it at most once on a miss
    ///
    /// # Errors
    ///
    /// Returns the computation's error, a serialization failure, or a lock
    /// acquisition failure.
    pub async fn fetch<F: Fetch>(&self, fetch: &F) -> Result<F::Value, F::Error> {
        let key = fetch.cache_key();

        if let Some(value) = self.local_value::<F::Value>(&key) {
            tracing::trace!(cache.key = %key, "local cache hit");
            return Ok(value);
        }

        if let Some((value, payload)) = self.remote_value::<F::Value>(&key).await {
            tracing::trace!(cache.key = %key, "remote cache hit");
            self.local.insert(key, payload, fetch.local_ttl(&value));
            return Ok(value);
        }

        tracing::debug!(cache.key = %key, "cache miss, acquiring lock");
        let guard = self.lock.acquire(&format!("{key}_lock")).await?;
        let filled = self.fill(&key, fetch).await;
        guard.release().await;

        let (value, payload) = filled?;
        self.local.insert(key, payload, fetch.local_ttl(&value));
        Ok(value)
    }

    /// Evicts `key` from both tiers
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier could not be updated. The local
    /// tier is always evicted.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.local.remove(key);
        self.remote.delete(key).await
    }

    async fn fill<F: Fetch>(&self, key: &str, fetch: &F) -> Result<(F::Value, Vec<u8>), F::Error> {
        if let Some(found) = self.remote_value::<F::Value>(key).await {
            tracing::debug!(cache.key = %key, "remote cache filled while waiting for lock");
            return Ok(found);
        }

        let value = fetch.compute().await?;
        let payload = serde_json::to_vec(&value).map_err(CacheError::from)?;

        if let Err(err) = self
            .remote
            .set(key, &payload, fetch.remote_ttl(&value))
            .await
        {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(cache.key = %key, error, "unable to write computed value to remote cache");
        }

        Ok((value, payload))
    }

    fn local_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let payload = self.local.get(key)?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(cache.key = %key, error, "discarding undecodable local cache entry");
                self.local.remove(key);
                None
            }
        }
    }

    async fn remote_value<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Vec<u8>)> {
        let payload = match self.remote.get(key).await {
            Ok(payload) => payload?,
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(cache.key = %key, error, "remote cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => Some((value, payload)),
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(cache.key = %key, error, "ignoring undecodable remote cache entry");
                None
            }
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for CacheAside<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheAside")
            .field("local", &self.local)
            .field("lock", &self.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use broker_clock::{TestClock, UnixTime};
    use color_eyre::Result;
    use thiserror::Error;
    use tracing_test::traced_test;

    use super::*;
    use crate::{InMemoryRemoteCache, LockConfig, LockStore};

    #[derive(Debug, Error)]
    enum TestError {
        #[error("compute failed")]
        Compute,
        #[error(transparent)]
        Cache(#[from] CacheError),
        #[error(transparent)]
        Lock(#[from] LockError),
    }

    struct Counted {
        key: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
        delay: Duration,
    }

    impl Counted {
        fn new(key: &'static str) -> Self {
            Self {
                key,
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Fetch for Counted {
        type Value = String;
        type Error = TestError;

        fn cache_key(&self) -> String {
            self.key.to_owned()
        }

        fn local_ttl(&self, _: &String) -> Duration {
            Duration::from_secs(30)
        }

        fn remote_ttl(&self, _: &String) -> Duration {
            Duration::from_secs(300)
        }

        async fn compute(&self) -> Result<String, TestError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(TestError::Compute)
            } else {
                Ok(format!("value-{n}"))
            }
        }
    }

    struct Fixture {
        clock: TestClock,
        remote: Arc<InMemoryRemoteCache<TestClock>>,
        cache: Arc<CacheAside<TestClock>>,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new(UnixTime(1_000_000));
        let remote = Arc::new(InMemoryRemoteCache::with_clock(clock.clone()));
        let lock = DistributedLock::with_clock(
            remote.clone(),
            LockConfig::new(
                Duration::from_millis(5),
                Duration::from_secs(10),
                Duration::from_secs(5),
            ),
            clock.clone(),
        );
        let cache = CacheAside::new(
            Arc::new(LocalCache::with_clock(clock.clone())),
            remote.clone(),
            lock,
        );
        Fixture {
            clock,
            remote,
            cache: Arc::new(cache),
        }
    }

    #[tokio::test]
    async fn computes_once_then_serves_locally() -> Result<()> {
        let fx = fixture();
        let fetch = Counted::new("k");

        assert_eq!(fx.cache.fetch(&fetch).await?, "value-1");
        assert_eq!(fx.cache.fetch(&fetch).await?, "value-1");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert!(fx.remote.get("k").await?.is_some());
        assert!(fx.remote.current("k_lock").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn remote_hit_populates_local() -> Result<()> {
        let fx = fixture();
        fx.remote
            .set("k", br#""from-remote""#, Duration::from_secs(300))
            .await?;
        let fetch = Counted::new("k");

        assert_eq!(fx.cache.fetch(&fetch).await?, "from-remote");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
        assert!(fx.cache.local().get("k").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn local_expiry_falls_back_to_remote() -> Result<()> {
        let fx = fixture();
        let fetch = Counted::new("k");

        fx.cache.fetch(&fetch).await?;
        fx.clock.advance(Duration::from_secs(31));
        assert!(fx.cache.local().get("k").is_none());

        assert_eq!(fx.cache.fetch(&fetch).await?, "value-1");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_not_cached_and_release_the_lock() -> Result<()> {
        let fx = fixture();
        let mut fetch = Counted::new("k");
        fetch.fail = true;

        assert!(matches!(
            fx.cache.fetch(&fetch).await,
            Err(TestError::Compute)
        ));
        assert!(fx.remote.get("k").await?.is_none());
        assert!(fx.remote.current("k_lock").await?.is_none());

        fetch.fail = false;
        assert_eq!(fx.cache.fetch(&fetch).await?, "value-2");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cold_fetches_compute_once() -> Result<()> {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&fx.cache);
                let fetch = Counted {
                    key: "hot",
                    calls: Arc::clone(&calls),
                    fail: false,
                    delay: Duration::from_millis(50),
                };
                tokio::spawn(async move { cache.fetch(&fetch).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await??, "value-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn held_lock_exhausts_patience() -> Result<()> {
        let fx = fixture();
        let squatter = crate::LockRecord::new(fx.clock.now());
        fx.remote.insert_if_absent("k_lock", &squatter).await?;

        let fetch = Counted::new("k");
        tokio::time::pause();
        let result = fx.cache.fetch(&fetch).await;

        assert!(matches!(
            result,
            Err(TestError::Lock(LockError::PatienceExhausted { .. }))
        ));
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    /// A remote tier whose reads or writes can be made to fail
    struct Unreliable {
        inner: InMemoryRemoteCache<TestClock>,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl RemoteCache for Unreliable {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            if self.fail_reads {
                return Err(CacheError::unavailable("connection reset"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError> {
            if self.fail_writes {
                return Err(CacheError::unavailable("connection reset"));
            }
            self.inner.set(key, payload, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
    }

    fn unreliable(
        clock: &TestClock,
        remote: Unreliable,
    ) -> (Arc<Unreliable>, Arc<InMemoryRemoteCache<TestClock>>, CacheAside<TestClock>) {
        let remote = Arc::new(remote);
        let locks = Arc::new(InMemoryRemoteCache::with_clock(clock.clone()));
        let cache = CacheAside::new(
            Arc::new(LocalCache::with_clock(clock.clone())),
            remote.clone(),
            DistributedLock::with_clock(locks.clone(), LockConfig::default(), clock.clone()),
        );
        (remote, locks, cache)
    }

    #[tokio::test]
    #[traced_test]
    async fn remote_write_failure_still_returns_the_value() -> Result<()> {
        let clock = TestClock::new(UnixTime(1_000_000));
        let (remote, locks, cache) = unreliable(
            &clock,
            Unreliable {
                inner: InMemoryRemoteCache::with_clock(clock.clone()),
                fail_reads: false,
                fail_writes: true,
            },
        );
        let fetch = Counted::new("k");

        assert_eq!(cache.fetch(&fetch).await?, "value-1");
        assert!(cache.local().get("k").is_some());
        assert!(remote.inner.get("k").await?.is_none());
        assert!(locks.current("k_lock").await?.is_none());
        assert!(logs_contain("unable to write computed value to remote cache"));

        assert_eq!(cache.fetch(&fetch).await?, "value-1");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn remote_read_failure_is_a_miss() -> Result<()> {
        let clock = TestClock::new(UnixTime(1_000_000));
        let inner = InMemoryRemoteCache::with_clock(clock.clone());
        inner
            .set("k", br#""from-remote""#, Duration::from_secs(300))
            .await?;
        let (_, locks, cache) = unreliable(
            &clock,
            Unreliable {
                inner,
                fail_reads: true,
                fail_writes: false,
            },
        );
        let fetch = Counted::new("k");

        assert_eq!(cache.fetch(&fetch).await?, "value-1");
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert!(locks.current("k_lock").await?.is_none());
        assert!(logs_contain("remote cache read failed, treating as miss"));
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() -> Result<()> {
        let fx = fixture();
        let fetch = Counted::new("k");

        fx.cache.fetch(&fetch).await?;
        fx.cache.invalidate("k").await?;

        assert!(fx.cache.local().get("k").is_none());
        assert!(fx.remote.get("k").await?.is_none());
        assert_eq!(fx.cache.fetch(&fetch).await?, "value-2");
        Ok(())
    }
}
