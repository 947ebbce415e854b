//! The shared cache tier

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use broker_clock::{Clock, System, UnixTime};
use parking_lot::Mutex;

use crate::{CacheError, LockRecord, LockStore};

/// A cache shared by every broker replica
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Gets an unexpired payload
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores a payload for `ttl`
    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Removes a payload, if present
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drops every expired payload, returning how many were dropped
    ///
    /// Engines that expire entries on their own need not override this.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

struct Stored {
    payload: Vec<u8>,
    expires_at: UnixTime,
}

/// A remote cache engine kept in process memory
///
/// Stands in for a shared engine in single-replica deployments and tests. It
/// also serves as a [`LockStore`], with each conditional operation performed
/// under a single mutex acquisition.
pub struct InMemoryRemoteCache<C = System> {
    entries: Mutex<HashMap<String, Stored>>,
    locks: Mutex<HashMap<String, LockRecord>>,
    clock: C,
}

impl InMemoryRemoteCache<System> {
    /// Constructs an empty cache using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl Default for InMemoryRemoteCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemoryRemoteCache<C> {
    /// Constructs an empty cache using a custom clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> RemoteCache for InMemoryRemoteCache<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if now < stored.expires_at => Ok(Some(stored.payload.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let stored = Stored {
            payload: payload.to_vec(),
            expires_at: self.clock.now() + ttl,
        };
        self.entries.lock().insert(key.to_owned(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, stored| now < stored.expires_at);
        Ok(before - entries.len())
    }
}

#[async_trait]
impl<C: Send + Sync> LockStore for InMemoryRemoteCache<C> {
    async fn insert_if_absent(&self, name: &str, record: &LockRecord) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock();
        if locks.contains_key(name) {
            Ok(false)
        } else {
            locks.insert(name.to_owned(), record.clone());
            Ok(true)
        }
    }

    async fn current(&self, name: &str) -> Result<Option<LockRecord>, CacheError> {
        Ok(self.locks.lock().get(name).cloned())
    }

    async fn delete_if_matches(
        &self,
        name: &str,
        record: &LockRecord,
    ) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock();
        if locks.get(name) == Some(record) {
            locks.remove(name);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for InMemoryRemoteCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InMemoryRemoteCache")
            .field("entries", &self.entries.lock().len())
            .field("locks", &self.locks.lock().len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use broker_clock::TestClock;
    use color_eyre::Result;

    use super::*;

    #[tokio::test]
    async fn entries_expire() -> Result<()> {
        let clock = TestClock::new(UnixTime(0));
        let cache = InMemoryRemoteCache::with_clock(clock.clone());

        cache.set("k", b"v", Duration::from_secs(60)).await?;
        assert_eq!(cache.get("k").await?, Some(b"v".to_vec()));

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn unread_expired_entries_are_purged() -> Result<()> {
        let clock = TestClock::new(UnixTime(0));
        let cache = InMemoryRemoteCache::with_clock(clock.clone());

        cache.set("short", b"v", Duration::from_secs(10)).await?;
        cache.set("other", b"v", Duration::from_secs(10)).await?;
        cache.set("long", b"v", Duration::from_secs(600)).await?;

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.purge_expired().await?, 2);
        assert_eq!(cache.entries.lock().len(), 1);
        assert_eq!(cache.get("long").await?, Some(b"v".to_vec()));
        assert_eq!(cache.purge_expired().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn insert_if_absent_is_exclusive() -> Result<()> {
        let cache = InMemoryRemoteCache::with_clock(TestClock::default());
        let first = LockRecord::new(UnixTime(1));
        let second = LockRecord::new(UnixTime(2));

        assert!(cache.insert_if_absent("l", &first).await?);
        assert!(!cache.insert_if_absent("l", &second).await?);
        assert!(!cache.delete_if_matches("l", &second).await?);
        assert!(cache.delete_if_matches("l", &first).await?);
        assert!(cache.insert_if_absent("l", &second).await?);
        Ok(())
    }
}
