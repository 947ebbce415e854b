//! Document persistence for sessions and stored credentials
//!
//! The store is deliberately small: documents are JSON values addressed by a
//! kind and an id. Typed access goes through the [`Record`] trait and the
//! helpers on `dyn Persistence`.

use std::{collections::HashMap, error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use broker_cache::{CacheError, LockRecord, LockStore};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Status;

/// A failure in the persistence layer
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The storage engine could not be reached or rejected the operation
    #[error("persistence backend unavailable")]
    Unavailable(#[source] Box<dyn StdError + Send + Sync + 'static>),
    /// A stored document did not have the expected shape
    #[error("malformed `{kind}` document `{id}`")]
    Malformed {
        /// The document kind
        kind: &'static str,
        /// The document id
        id: String,
        /// The decoding failure
        #[source]
        source: serde_json::Error,
    },
    /// A document could not be encoded
    #[error("unable to encode `{kind}` document")]
    Encode {
        /// The document kind
        kind: &'static str,
        /// The encoding failure
        #[source]
        source: serde_json::Error,
    },
}

impl From<PersistenceError> for Status {
    fn from(err: PersistenceError) -> Self {
        let error: &dyn StdError = &err;
        tracing::warn!(error, "persistence failure");
        match err {
            PersistenceError::Unavailable(_) => Self::unavailable("Database unavailable"),
            PersistenceError::Malformed { .. } | PersistenceError::Encode { .. } => {
                Self::internal("Database record could not be processed")
            }
        }
    }
}

/// A storage engine for JSON documents
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Reads a document
    async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, PersistenceError>;

    /// Writes a document, replacing any existing one
    async fn save(&self, kind: &str, id: &str, doc: Value) -> Result<(), PersistenceError>;

    /// Writes a document only if none exists under the same id
    ///
    /// Returns whether the write happened. Must be a single atomic
    /// conditional write.
    async fn insert_if_absent(
        &self,
        kind: &str,
        id: &str,
        doc: Value,
    ) -> Result<bool, PersistenceError>;

    /// Deletes a document, returning whether it existed
    async fn delete(&self, kind: &str, id: &str) -> Result<bool, PersistenceError>;

    /// Reads every document of a kind
    async fn scan(&self, kind: &str) -> Result<Vec<(String, Value)>, PersistenceError>;

    /// Deletes documents whose numeric `field` is at or before `cutoff`
    ///
    /// At most `limit` documents are deleted when a limit is given. Returns
    /// the number deleted.
    async fn delete_stale(
        &self,
        kind: &str,
        field: &str,
        cutoff: u64,
        limit: Option<usize>,
    ) -> Result<usize, PersistenceError>;
}

/// A typed document
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// The document kind, used as a table or collection name
    const KIND: &'static str;

    /// The document id
    fn record_id(&self) -> &str;
}

impl<'a> dyn Persistence + 'a {
    /// Reads and decodes a record
    pub async fn load<R: Record>(&self, id: &str) -> Result<Option<R>, PersistenceError> {
        match self.get(R::KIND, id).await? {
            Some(doc) => decode(id, doc).map(Some),
            None => Ok(None),
        }
    }

    /// Encodes and writes a record
    pub async fn store<R: Record>(&self, record: &R) -> Result<(), PersistenceError> {
        let doc = encode(record)?;
        self.save(R::KIND, record.record_id(), doc).await
    }

    /// Deletes a record by id
    pub async fn remove<R: Record>(&self, id: &str) -> Result<bool, PersistenceError> {
        self.delete(R::KIND, id).await
    }

    /// Reads and decodes every record of a kind
    ///
    /// Malformed documents are skipped with a warning.
    pub async fn load_all<R: Record>(&self) -> Result<Vec<R>, PersistenceError> {
        let docs = self.scan(R::KIND).await?;
        let mut records = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            match decode(&id, doc) {
                Ok(record) => records.push(record),
                Err(err) => {
                    let error: &dyn StdError = &err;
                    tracing::warn!(error, record.kind = R::KIND, record.id = %id, "skipping malformed record");
                }
            }
        }
        Ok(records)
    }
}

fn encode<R: Record>(record: &R) -> Result<Value, PersistenceError> {
    serde_json::to_value(record).map_err(|source| PersistenceError::Encode {
        kind: R::KIND,
        source,
    })
}

fn decode<R: Record>(id: &str, doc: Value) -> Result<R, PersistenceError> {
    serde_json::from_value(doc).map_err(|source| PersistenceError::Malformed {
        kind: R::KIND,
        id: id.to_owned(),
        source,
    })
}

/// A persistence engine kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    docs: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryPersistence {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn get(&self, kind: &str, id: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self
            .docs
            .lock()
            .get(kind)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn save(&self, kind: &str, id: &str, doc: Value) -> Result<(), PersistenceError> {
        self.docs
            .lock()
            .entry(kind.to_owned())
            .or_default()
            .insert(id.to_owned(), doc);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        kind: &str,
        id: &str,
        doc: Value,
    ) -> Result<bool, PersistenceError> {
        let mut all = self.docs.lock();
        let docs = all.entry(kind.to_owned()).or_default();
        if docs.contains_key(id) {
            Ok(false)
        } else {
            docs.insert(id.to_owned(), doc);
            Ok(true)
        }
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .docs
            .lock()
            .get_mut(kind)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn scan(&self, kind: &str) -> Result<Vec<(String, Value)>, PersistenceError> {
        Ok(self
            .docs
            .lock()
            .get(kind)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_stale(
        &self,
        kind: &str,
        field: &str,
        cutoff: u64,
        limit: Option<usize>,
    ) -> Result<usize, PersistenceError> {
        let mut all = self.docs.lock();
        let docs = match all.get_mut(kind) {
            Some(docs) => docs,
            None => return Ok(0),
        };

        let stale: Vec<String> = docs
            .iter()
            .filter(|(_, doc)| {
                doc.get(field)
                    .and_then(Value::as_u64)
                    .map_or(false, |v| v <= cutoff)
            })
            .map(|(id, _)| id.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        for id in &stale {
            docs.remove(id);
        }
        Ok(stale.len())
    }
}

const LOCK_KIND: &str = "lock";

/// Distributed locks kept as documents in a [`Persistence`] engine
///
/// Acquisition relies on [`Persistence::insert_if_absent`]. Release reads the
/// current holder and deletes it only if it is still ours; a reclaim racing
/// the release can slip between the two, which at worst frees a lock early.
#[derive(Clone)]
pub struct PersistenceLockStore {
    persistence: Arc<dyn Persistence>,
}

impl PersistenceLockStore {
    /// Keeps locks in the given engine
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

impl std::fmt::Debug for PersistenceLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PersistenceLockStore").finish_non_exhaustive()
    }
}

fn lock_err(err: PersistenceError) -> CacheError {
    CacheError::unavailable(err)
}

#[async_trait]
impl LockStore for PersistenceLockStore {
    async fn insert_if_absent(&self, name: &str, record: &LockRecord) -> Result<bool, CacheError> {
        let doc = serde_json::to_value(record)?;
        self.persistence
            .insert_if_absent(LOCK_KIND, name, doc)
            .await
            .map_err(lock_err)
    }

    async fn current(&self, name: &str) -> Result<Option<LockRecord>, CacheError> {
        match self.persistence.get(LOCK_KIND, name).await.map_err(lock_err)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn delete_if_matches(
        &self,
        name: &str,
        record: &LockRecord,
    ) -> Result<bool, CacheError> {
        if self.current(name).await?.as_ref() != Some(record) {
            return Ok(false);
        }
        self.persistence
            .delete(LOCK_KIND, name)
            .await
            .map_err(lock_err)
    }
}

#[cfg(test)]
mod tests {
    use broker_cache::{DistributedLock, LockConfig};
    use broker_clock::{TestClock, UnixTime};

    use color_eyre::Result;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: String,
        expires_at: u64,
    }

    impl Record for Widget {
        const KIND: &'static str = "widget";

        fn record_id(&self) -> &str {
            &self.id
        }
    }

    fn widget(id: &str, expires_at: u64) -> Widget {
        Widget {
            id: id.to_owned(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn typed_round_trip() -> Result<()> {
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());

        store.store(&widget("a", 10)).await?;
        assert_eq!(store.load::<Widget>("a").await?, Some(widget("a", 10)));
        assert_eq!(store.load::<Widget>("b").await?, None);

        assert!(store.remove::<Widget>("a").await?);
        assert!(!store.remove::<Widget>("a").await?);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_documents_are_reported() -> Result<()> {
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        store.save("widget", "bad", json!({ "id": 5 })).await?;

        assert!(matches!(
            store.load::<Widget>("bad").await,
            Err(PersistenceError::Malformed { .. })
        ));
        assert!(store.load_all::<Widget>().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_stale_honors_cutoff_and_limit() -> Result<()> {
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        for (id, at) in [("a", 5), ("b", 10), ("c", 15), ("d", 20)] {
            store.store(&widget(id, at)).await?;
        }

        assert_eq!(store.delete_stale("widget", "expires_at", 15, Some(2)).await?, 2);
        assert_eq!(store.load_all::<Widget>().await?.len(), 2);

        assert_eq!(store.delete_stale("widget", "expires_at", 15, None).await?, 1);
        let left = store.load_all::<Widget>().await?;
        assert_eq!(left, vec![widget("d", 20)]);
        Ok(())
    }

    #[tokio::test]
    async fn insert_if_absent_does_not_overwrite() -> Result<()> {
        let store = InMemoryPersistence::new();
        assert!(store.insert_if_absent("lock", "k", json!(1)).await?);
        assert!(!store.insert_if_absent("lock", "k", json!(2)).await?);
        assert_eq!(store.get("lock", "k").await?, Some(json!(1)));
        Ok(())
    }

    #[tokio::test]
    async fn locks_can_live_in_persistence() -> Result<()> {
        let store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let locks = Arc::new(PersistenceLockStore::new(store.clone()));
        let clock = TestClock::new(UnixTime(1_000));
        let lock = DistributedLock::with_clock(locks.clone(), LockConfig::default(), clock);

        let guard = lock.acquire("k_lock").await?;
        assert!(store.get("lock", "k_lock").await?.is_some());

        let intruder = LockRecord::new(UnixTime(1_000));
        assert!(!locks.insert_if_absent("k_lock", &intruder).await?);
        assert!(!locks.delete_if_matches("k_lock", &intruder).await?);

        guard.release().await;
        assert!(store.get("lock", "k_lock").await?.is_none());
        Ok(())
    }
}
