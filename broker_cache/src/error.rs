//! Cache and lock errors

use std::{error::Error as StdError, time::Duration};

use thiserror::Error;

/// A failure talking to a cache tier or lock store
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing engine could not be reached or rejected the operation
    #[error("cache backend unavailable")]
    Unavailable(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// A value could not be serialized for storage
    #[error("unable to serialize cache payload")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Wraps a backend failure
    pub fn unavailable(source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        Self::Unavailable(source.into())
    }
}

/// A failure to acquire a distributed lock
///
/// Both variants are fatal to the caller: proceeding without the lock would
/// reopen the stampede the lock exists to prevent.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by someone else for longer than the patience timeout
    #[error("gave up waiting for lock `{name}` after {waited:?}")]
    PatienceExhausted {
        /// Name of the contended lock
        name: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// The lock store itself failed
    #[error("lock store failure while acquiring `{name}`")]
    Store {
        /// Name of the lock being acquired
        name: String,
        /// Underlying store failure
        #[source]
        source: CacheError,
    },
}
