//! Two-tier cache-aside fetching for expensive credentials
//!
//! Values are looked up first in a short-lived [`LocalCache`] held in process
//! memory, then in a [`RemoteCache`] shared by every replica. On a miss in
//! both, a [`DistributedLock`] ensures that only one replica computes the
//! value while the others wait for it to appear in the remote tier.
//!
//! The [`Fetch`] trait describes a single computation and its cache key;
//! [`CacheAside`] drives the lookup and fill sequence.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]

mod error;
mod fetcher;
mod local;
mod lock;
mod remote;

pub use error::{CacheError, LockError};
pub use fetcher::{CacheAside, Fetch};
pub use local::LocalCache;
pub use lock::{DistributedLock, LockConfig, LockGuard, LockRecord, LockStore};
pub use remote::{InMemoryRemoteCache, RemoteCache};
