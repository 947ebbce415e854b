//! An in-process cache tier with short-lived entries

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use broker_clock::{Clock, System, UnixTime};
use parking_lot::Mutex;

struct LocalEntry {
    payload: Arc<[u8]>,
    expires_at: UnixTime,
}

/// The process-local cache tier
///
/// Entries hold serialized payloads and are evicted lazily when read after
/// their expiry, or eagerly through [`purge_expired`][Self::purge_expired].
pub struct LocalCache<C = System> {
    entries: Mutex<HashMap<String, LocalEntry>>,
    clock: C,
}

impl LocalCache<System> {
    /// Constructs an empty local cache using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl Default for LocalCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> LocalCache<C> {
    /// Constructs an empty local cache using a custom clock
    ///
    /// Useful for testing purposes
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Removes an entry, if present
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of entries currently held, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<C: Clock> LocalCache<C> {
    /// Gets an unexpired payload
    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(Arc::clone(&entry.payload)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores a payload for `ttl`
    ///
    /// A zero `ttl` stores nothing.
    pub fn insert(&self, key: impl Into<String>, payload: impl Into<Arc<[u8]>>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let entry = LocalEntry {
            payload: payload.into(),
            expires_at: self.clock.now() + ttl,
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Evicts every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }
}

impl<C: fmt::Debug> fmt::Debug for LocalCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("entries", &self.entries.lock().len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use broker_clock::TestClock;

    use super::*;

    #[test]
    fn serves_until_expiry() {
        let clock = TestClock::new(UnixTime(10_000));
        let cache = LocalCache::with_clock(clock.clone());

        cache.insert("k", b"value".to_vec(), Duration::from_secs(30));
        assert_eq!(cache.get("k").as_deref(), Some(&b"value"[..]));

        clock.advance(Duration::from_secs(29));
        assert!(cache.get("k").is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = LocalCache::with_clock(TestClock::new(UnixTime(0)));
        cache.insert("k", b"value".to_vec(), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_removes_only_expired() {
        let clock = TestClock::new(UnixTime(0));
        let cache = LocalCache::with_clock(clock.clone());

        cache.insert("short", b"a".to_vec(), Duration::from_secs(1));
        cache.insert("long", b"b".to_vec(), Duration::from_secs(60));
        clock.advance(Duration::from_secs(5));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }
}
