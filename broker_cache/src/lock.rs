//! A polling distributed mutex over any store with atomic insert-if-absent
//!
//! This is best-effort mutual exclusion, not consensus. A lock is a record
//! inserted under the lock's name; whoever inserts it first holds the lock.
//! Waiters poll at a fixed interval. A record older than the deadlock timeout
//! is presumed abandoned by a crashed holder and is reclaimed. A waiter that
//! runs out of patience fails hard instead of proceeding unlocked.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use broker_clock::{Clock, System, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{CacheError, LockError};

/// The record stored under a held lock's name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Random token identifying the holder
    pub holder: String,
    /// When the holder acquired the lock
    pub acquired_at: UnixTime,
}

impl LockRecord {
    /// A fresh record for a new acquisition attempt
    pub fn new(acquired_at: UnixTime) -> Self {
        Self {
            holder: uuid::Uuid::new_v4().to_string(),
            acquired_at,
        }
    }
}

/// A store offering the atomic primitives the lock depends on
///
/// Without an atomic insert-if-absent two racers could both believe they hold
/// the lock, so implementations must make [`insert_if_absent`] a single
/// conditional write.
///
/// [`insert_if_absent`]: LockStore::insert_if_absent
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Inserts `record` under `name` only if nothing is stored there yet
    ///
    /// Returns whether the insert happened.
    async fn insert_if_absent(&self, name: &str, record: &LockRecord) -> Result<bool, CacheError>;

    /// Reads the record currently stored under `name`
    async fn current(&self, name: &str) -> Result<Option<LockRecord>, CacheError>;

    /// Deletes the record under `name` only if it still equals `record`
    ///
    /// Returns whether the delete happened.
    async fn delete_if_matches(&self, name: &str, record: &LockRecord)
        -> Result<bool, CacheError>;
}

/// Timing configuration for lock acquisition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockConfig {
    poll_interval: Duration,
    deadlock_timeout: Duration,
    patience_timeout: Duration,
}

impl Default for LockConfig {
    /// Default lock configuration
    ///
    /// Polls every 100 ms, reclaims locks held for 10 seconds, and gives up
    /// after waiting 20 seconds.
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            deadlock_timeout: Duration::from_secs(10),
            patience_timeout: Duration::from_secs(20),
        }
    }
}

impl LockConfig {
    /// Constructs a new lock configuration
    ///
    /// Waiters check the lock every `poll_interval`. A held lock older than
    /// `deadlock_timeout` is presumed abandoned and reclaimed. A waiter that
    /// has waited `patience_timeout` fails.
    pub fn new(
        poll_interval: Duration,
        deadlock_timeout: Duration,
        patience_timeout: Duration,
    ) -> Self {
        Self {
            poll_interval,
            deadlock_timeout,
            patience_timeout,
        }
    }

    /// Interval between acquisition attempts
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Age after which a held lock is reclaimed
    pub fn deadlock_timeout(&self) -> Duration {
        self.deadlock_timeout
    }

    /// Maximum time spent waiting for the lock
    pub fn patience_timeout(&self) -> Duration {
        self.patience_timeout
    }
}

/// Named distributed mutexes backed by a [`LockStore`]
#[derive(Clone)]
pub struct DistributedLock<C = System> {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    clock: C,
}

impl DistributedLock<System> {
    /// Constructs a lock manager using the system clock
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self::with_clock(store, config, System)
    }
}

impl<C> DistributedLock<C> {
    /// Constructs a lock manager using a custom clock for staleness checks
    pub fn with_clock(store: Arc<dyn LockStore>, config: LockConfig, clock: C) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// The timing configuration in use
    pub fn config(&self) -> &LockConfig {
        &self.config
    }
}

impl<C: Clock> DistributedLock<C> {
    /// Acquires the named lock, waiting up to the patience timeout
    ///
    /// # Errors
    ///
    /// Fails if the patience timeout elapses or the store fails.
    pub async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let started = tokio::time::Instant::now();
        let store_err = |source| LockError::Store {
            name: name.to_owned(),
            source,
        };

        loop {
            let record = LockRecord::new(self.clock.now());
            if self
                .store
                .insert_if_absent(name, &record)
                .await
                .map_err(store_err)?
            {
                tracing::trace!(lock = %name, "lock acquired");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    name: name.to_owned(),
                    record: Some(record),
                });
            }

            if let Some(held) = self.store.current(name).await.map_err(store_err)? {
                let age = self.clock.now() - held.acquired_at;
                if age >= self.config.deadlock_timeout {
                    tracing::warn!(
                        lock = %name,
                        age_ms = age.as_millis() as u64,
                        "reclaiming abandoned lock"
                    );
                    self.store
                        .delete_if_matches(name, &held)
                        .await
                        .map_err(store_err)?;
                    continue;
                }
            }

            let waited = started.elapsed();
            if waited >= self.config.patience_timeout {
                tracing::warn!(lock = %name, waited_ms = waited.as_millis() as u64, "lock wait exhausted");
                return Err(LockError::PatienceExhausted {
                    name: name.to_owned(),
                    waited,
                });
            }

            tracing::trace!(lock = %name, "lock held elsewhere, waiting");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for DistributedLock<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

/// A held lock
///
/// Call [`release`][Self::release] when done. A guard dropped without being
/// released (on panic or cancellation) schedules the release on the current
/// runtime; failing that, the deadlock timeout eventually frees the lock.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    name: String,
    record: Option<LockRecord>,
}

impl LockGuard {
    /// The name of the held lock
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock
    pub async fn release(mut self) {
        if let Some(record) = self.record.take() {
            release(&*self.store, &self.name, &record).await;
        }
    }
}

async fn release(store: &dyn LockStore, name: &str, record: &LockRecord) {
    match store.delete_if_matches(name, record).await {
        Ok(true) => tracing::trace!(lock = %name, "lock released"),
        Ok(false) => {
            tracing::warn!(lock = %name, "lock was reclaimed by another holder before release")
        }
        Err(err) => {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(lock = %name, error, "unable to release lock")
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let store = Arc::clone(&self.store);
            let name = std::mem::take(&mut self.name);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { release(&*store, &name, &record).await });
                }
                Err(_) => {
                    tracing::warn!(lock = %name, "lock guard dropped outside a runtime; relying on deadlock timeout")
                }
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("record", &self.record)
            .finish()
    }
}
