//! Atomic multi-operation transactions with cache reconciliation.
//!
//! The engine opens a backend-level atomic section with immediate write
//! intent, hands the caller a [`Transaction`] handle whose operations write
//! through the backend's prepared statements, and journals every mutation.
//! On success the section commits and the journal is replayed onto the
//! cache; on any failure the section rolls back and the cache is restored
//! from the per-key backups taken at first touch. Either way no partial
//! state survives, in the backend or in the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::codec;
use crate::error::{DatabaseError, Result};
use crate::traits::StorageBackend;
use crate::validate::{validate_key, validate_value};
use crate::value::Value;

enum JournalOp {
    Set { key: String, value: Value },
    Delete { key: String },
}

#[derive(Default)]
struct Journal {
    ops: Vec<JournalOp>,
    /// Transactional read-your-writes view.
    working: HashMap<String, Option<Value>>,
    /// Cached value (or absence) per key at first touch.
    backup: HashMap<String, Option<Value>>,
}

struct TxInner {
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<Cache>>,
    journal: Mutex<Journal>,
}

/// Handle passed to the transaction closure. All operations run inside the
/// backend's open atomic section.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    /// Read a value. Keys written earlier in this transaction are served
    /// from the transactional view; everything else reads the backend
    /// inside the atomic section.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        if let Some(seen) = self.inner.journal.lock().working.get(key) {
            return Ok(seen.clone());
        }
        let text = self
            .inner
            .backend
            .get_value(key)
            .await
            .map_err(DatabaseError::read)?;
        Ok(text.map(|text| codec::decode(&text)))
    }

    /// Write a value through the atomic section and journal it.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        validate_key(key)?;
        let value = value.into();
        validate_value(&value)?;
        let encoded = codec::encode(&value);
        self.backup_cache_entry(key);
        self.inner
            .backend
            .set_value(key, &encoded)
            .await
            .map_err(DatabaseError::write)?;
        let mut journal = self.inner.journal.lock();
        journal.ops.push(JournalOp::Set {
            key: key.to_string(),
            value: value.clone(),
        });
        journal.working.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Delete a key through the atomic section and journal it.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.backup_cache_entry(key);
        let existed = self
            .inner
            .backend
            .delete_value(key)
            .await
            .map_err(DatabaseError::write)?;
        let mut journal = self.inner.journal.lock();
        journal.ops.push(JournalOp::Delete {
            key: key.to_string(),
        });
        journal.working.insert(key.to_string(), None);
        Ok(existed)
    }

    /// Snapshot the cached state of `key` the first time it is touched.
    fn backup_cache_entry(&self, key: &str) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let mut journal = self.inner.journal.lock();
        if !journal.backup.contains_key(key) {
            let previous = cache.peek(key);
            journal.backup.insert(key.to_string(), previous);
        }
    }
}

/// Run `f` inside a backend atomic section. The caller is responsible for
/// flushing any pending batch beforehand and for asserting exclusive use of
/// the connection.
pub(crate) async fn run<F, Fut, T>(
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<Cache>>,
    f: F,
) -> Result<T>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !backend.supports_transactions() {
        return Err(DatabaseError::Transaction(anyhow!(
            "{} backend does not support transactions",
            backend.name()
        )));
    }

    backend
        .begin_transaction()
        .await
        .map_err(DatabaseError::Transaction)?;

    let tx = Transaction {
        inner: Arc::new(TxInner {
            backend: Arc::clone(&backend),
            cache,
            journal: Mutex::new(Journal::default()),
        }),
    };
    let inner = Arc::clone(&tx.inner);

    match f(tx).await {
        Ok(value) => match backend.commit_transaction().await {
            Ok(()) => {
                apply_to_cache(&inner);
                Ok(value)
            }
            Err(commit_err) => {
                abort(&inner).await;
                Err(DatabaseError::Transaction(commit_err))
            }
        },
        Err(caller_err) => {
            abort(&inner).await;
            Err(DatabaseError::Transaction(anyhow::Error::new(caller_err)))
        }
    }
}

/// Replay the journal onto the cache after a successful commit.
fn apply_to_cache(inner: &Arc<TxInner>) {
    let Some(cache) = &inner.cache else {
        return;
    };
    let journal = inner.journal.lock();
    for op in &journal.ops {
        match op {
            JournalOp::Set { key, value } => cache.set(key, value.clone(), None),
            JournalOp::Delete { key } => {
                cache.delete(key);
            }
        }
    }
    debug!(ops = journal.ops.len(), "transaction committed");
}

/// Roll the backend back and restore the cache from the backups.
async fn abort(inner: &Arc<TxInner>) {
    if let Err(err) = inner.backend.rollback_transaction().await {
        warn!(%err, "transaction rollback failed");
    }
    if let Some(cache) = &inner.cache {
        let journal = inner.journal.lock();
        for (key, previous) in &journal.backup {
            match previous {
                Some(value) => cache.set(key, value.clone(), None),
                None => {
                    cache.delete(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SqliteBackend;
    use crate::cache::CacheConfig;

    async fn backend() -> (tempfile::TempDir, Arc<dyn StorageBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("tx.db"), true);
        backend.connect().await.unwrap();
        (dir, Arc::new(backend))
    }

    #[tokio::test]
    async fn commit_applies_backend_and_cache() {
        let (_dir, backend) = backend().await;
        let cache = Arc::new(Cache::new(CacheConfig::default()));

        let result = run(Arc::clone(&backend), Some(Arc::clone(&cache)), |tx| {
            async move {
                tx.set("a", Value::from(1)).await?;
                tx.set("b", Value::from(2)).await?;
                Ok(12)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 12);

        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(cache.peek("a"), Some(Value::from(1)));
        assert_eq!(cache.peek("b"), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn failure_rolls_back_backend_and_cache() {
        let (_dir, backend) = backend().await;
        let cache = Arc::new(Cache::new(CacheConfig::default()));
        backend.set_value("a", "1").await.unwrap();
        cache.set("a", Value::from(1), None);

        let err = run(Arc::clone(&backend), Some(Arc::clone(&cache)), |tx| {
            async move {
                tx.set("a", Value::from(99)).await?;
                tx.set("fresh", Value::from(3)).await?;
                Err::<(), _>(DatabaseError::InvalidNumber("Insufficient funds".to_string()))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DatabaseError::Transaction(_)));

        // Backend untouched, cache restored.
        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(backend.get_value("fresh").await.unwrap(), None);
        assert_eq!(cache.peek("a"), Some(Value::from(1)));
        assert_eq!(cache.peek("fresh"), None);
    }

    #[tokio::test]
    async fn transactional_reads_see_own_writes() {
        let (_dir, backend) = backend().await;
        backend.set_value("n", "5").await.unwrap();

        run(Arc::clone(&backend), None, |tx| async move {
            assert_eq!(tx.get("n").await?, Some(Value::from(5)));
            tx.set("n", Value::from(6)).await?;
            assert_eq!(tx.get("n").await?, Some(Value::from(6)));
            tx.delete("n").await?;
            assert_eq!(tx.get("n").await?, None);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unsupported_backend_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let backend = crate::backends::JsonFileBackend::new(dir.path().join("doc.json"));
        backend.connect().await.unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(backend);

        let err = run(backend, None, |_tx| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Transaction(_)));
    }
}
