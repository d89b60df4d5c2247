//! The database façade.
//!
//! [`Database`] ties the pieces together: reads consult the cache before the
//! backend, writes go through the batch coalescer (when enabled) or straight
//! to the backend, every mutation keeps the cache coherent and fans out to
//! the watcher manager, and transactions assert exclusive use of the
//! connection for the duration of their atomic section.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::backends::{JsonFileBackend, SqliteBackend};
use crate::batch::{BatchConfig, BatchError, BatchOp, BatchProcessor};
use crate::cache::{Cache, CacheConfig, CacheStats};
use crate::codec;
use crate::error::{DatabaseError, Result};
use crate::options::Options;
use crate::query::Query;
use crate::traits::{EntryStream, StorageBackend};
use crate::transaction::{self, Transaction};
use crate::validate::{BackendKind, resolve_backend, validate_key, validate_value};
use crate::value::Value;
use crate::watcher::{
    EventKind, WatchCallback, WatchEvent, WatchPattern, WatcherConfig, WatcherError, WatcherId,
    WatcherManager,
};

/// Façade-level operation counters plus component statistics.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    /// Present when caching is enabled.
    pub cache: Option<CacheStats>,
    /// Pending operations in the batch queue.
    pub batch_queue: usize,
}

#[derive(Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

pub(crate) struct DatabaseInner {
    path: PathBuf,
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<Cache>>,
    batch: Option<Arc<BatchProcessor>>,
    watchers: WatcherManager,
    options: Options,
    /// Normal operations hold this shared; a transaction holds it
    /// exclusively for its whole atomic section.
    tx_lock: Arc<RwLock<()>>,
    counters: OpCounters,
}

/// Embedded asynchronous key-value store.
///
/// # Example
///
/// ```rust,no_run
/// use quickdb::{Database, Value};
///
/// #[tokio::main]
/// async fn main() -> quickdb::Result<()> {
///     let db = Database::open("data.db").await?;
///     db.set("greeting", "hello").await?;
///     assert_eq!(db.get("greeting").await?, Some(Value::from("hello")));
///     db.destroy(true).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (creating if needed) the database at `path` with defaults. The
    /// filename extension selects the backend: `.json` for the document
    /// file, `.db` / `.sqlite` for the table file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, Options::default()).await
    }

    /// Open with explicit [`Options`].
    pub async fn open_with_options(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let kind = resolve_backend(&path)?;
        let backend: Arc<dyn StorageBackend> = match kind {
            BackendKind::JsonFile => Arc::new(JsonFileBackend::new(&path)),
            BackendKind::Sqlite => Arc::new(SqliteBackend::new(&path, options.wal_mode)),
        };

        match tokio::time::timeout(options.timeout_duration(), backend.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(DatabaseError::connection(err)),
            Err(_) => return Err(DatabaseError::Timeout(options.timeout_duration())),
        }

        let cache = options.cache.then(|| {
            Arc::new(Cache::new(CacheConfig {
                max_size: options.cache_size,
                max_memory_bytes: options.cache_max_memory_bytes(),
                default_ttl: options.cache_ttl_duration(),
            }))
        });

        let tx_lock = Arc::new(RwLock::new(()));
        let batch = options.batch.then(|| {
            let backend = Arc::clone(&backend);
            let tx_lock = Arc::clone(&tx_lock);
            let executor = Arc::new(move |ops: Vec<BatchOp>| {
                let backend = Arc::clone(&backend);
                let tx_lock = Arc::clone(&tx_lock);
                let fut = async move {
                    let _shared = tx_lock.read().await;
                    backend
                        .batch_set(ops.into_iter().map(|op| (op.key, op.value)).collect())
                        .await
                };
                Box::pin(fut) as futures_util::future::BoxFuture<'static, anyhow::Result<()>>
            });
            BatchProcessor::new(
                BatchConfig::sized(
                    options.batch_size,
                    Duration::from_millis(options.batch_delay),
                    Duration::from_millis(options.operation_timeout),
                ),
                executor,
            )
        });

        info!(
            path = %path.display(),
            backend = backend.name(),
            cache = options.cache,
            batch = options.batch,
            "database opened"
        );
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path,
                backend,
                cache,
                batch,
                watchers: WatcherManager::new(WatcherConfig::default()),
                options,
                tx_lock,
                counters: OpCounters::default(),
            }),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Name of the active backend.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    // ===== Primitive operations =====

    /// Read a value: cache first, then the backend (populating the cache).
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        self.inner.counters.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(cache) = &self.inner.cache {
            if let Some(hit) = cache.get(key) {
                return Ok(Some(hit));
            }
        }
        let text = {
            let _shared = self.inner.tx_lock.read().await;
            self.read_op(self.inner.backend.get_value(key)).await?
        };
        let value = text.map(|text| codec::decode(&text));
        if let (Some(cache), Some(value)) = (&self.inner.cache, &value) {
            cache.set(key, value.clone(), None);
        }
        Ok(value)
    }

    /// Read a value, falling back to `default` when the key is absent.
    pub async fn get_or(&self, key: &str, default: impl Into<Value>) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.into()))
    }

    /// Store a value and dispatch a `set` event.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        validate_key(key)?;
        validate_value(&value)?;
        let old = self.cached_old(key);
        self.write_value(key, &value).await?;
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .notify(EventKind::Set, key, Some(value), old);
        Ok(())
    }

    /// Append to the array at `key` (missing keys become an empty array)
    /// and return the new array.
    pub async fn push(&self, key: &str, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        validate_key(key)?;
        validate_value(&value)?;
        let current = self.get(key).await?;
        let mut items = match current.clone() {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(DatabaseError::NotArray(key.to_string())),
        };
        items.push(value);
        let updated = Value::Array(items);
        self.write_value(key, &updated).await?;
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .notify(EventKind::Push, key, Some(updated.clone()), current);
        Ok(updated)
    }

    /// Remove every occurrence of `value` from the array at `key` and
    /// return the new array.
    pub async fn pull(&self, key: &str, value: impl Into<Value>) -> Result<Value> {
        let value = value.into();
        validate_key(key)?;
        let current = self.get(key).await?;
        let Some(Value::Array(items)) = current.clone() else {
            return Err(DatabaseError::NotArray(key.to_string()));
        };
        let remaining: Vec<Value> = items.into_iter().filter(|item| *item != value).collect();
        let updated = Value::Array(remaining);
        self.write_value(key, &updated).await?;
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .notify(EventKind::Pull, key, Some(updated.clone()), current);
        Ok(updated)
    }

    /// Add `amount` to the number at `key` (missing keys count as zero) and
    /// return the new number.
    pub async fn add(&self, key: &str, amount: f64) -> Result<f64> {
        self.adjust(key, amount, EventKind::Add).await
    }

    /// Subtract `amount` from the number at `key` and return the result.
    pub async fn subtract(&self, key: &str, amount: f64) -> Result<f64> {
        self.adjust(key, -amount, EventKind::Subtract).await
    }

    async fn adjust(&self, key: &str, delta: f64, event: EventKind) -> Result<f64> {
        validate_key(key)?;
        if !delta.is_finite() {
            return Err(DatabaseError::InvalidNumber(
                "amount must be a finite number".to_string(),
            ));
        }
        let current = self.get(key).await?;
        let base = match &current {
            None => 0.0,
            Some(Value::Number(n)) => *n,
            Some(_) => {
                return Err(DatabaseError::InvalidNumber(format!(
                    "value at key '{key}' is not a number"
                )));
            }
        };
        let updated = base + delta;
        self.write_value(key, &Value::Number(updated)).await?;
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .notify(event, key, Some(Value::Number(updated)), current);
        Ok(updated)
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let old = self.get(key).await?;
        let existed = {
            let _shared = self.inner.tx_lock.read().await;
            self.write_op(self.inner.backend.delete_value(key)).await?
        };
        if let Some(cache) = &self.inner.cache {
            cache.delete(key);
        }
        self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.notify(EventKind::Delete, key, None, old);
        Ok(existed)
    }

    /// Store many entries through the backend's batch primitive.
    pub async fn bulk_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in &entries {
            validate_key(key)?;
            validate_value(value)?;
        }
        let encoded: Vec<(String, String)> = entries
            .iter()
            .map(|(key, value)| (key.clone(), codec::encode(value)))
            .collect();
        let olds: Vec<Option<Value>> = entries.iter().map(|(key, _)| self.cached_old(key)).collect();
        {
            let _shared = self.inner.tx_lock.read().await;
            self.write_op(self.inner.backend.batch_set(encoded)).await?;
        }
        self.inner
            .counters
            .writes
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        for ((key, value), old) in entries.into_iter().zip(olds) {
            if let Some(cache) = &self.inner.cache {
                cache.set(&key, value.clone(), None);
            }
            self.inner
                .watchers
                .notify(EventKind::Set, &key, Some(value), old);
        }
        Ok(())
    }

    /// Delete many keys through the backend's batch primitive.
    pub async fn bulk_delete(&self, keys: Vec<String>) -> Result<()> {
        for key in &keys {
            validate_key(key)?;
        }
        let olds: Vec<Option<Value>> = keys.iter().map(|key| self.cached_old(key)).collect();
        {
            let _shared = self.inner.tx_lock.read().await;
            self.write_op(self.inner.backend.batch_delete(keys.clone()))
                .await?;
        }
        self.inner
            .counters
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        for (key, old) in keys.into_iter().zip(olds) {
            if let Some(cache) = &self.inner.cache {
                cache.delete(&key);
            }
            self.inner.watchers.notify(EventKind::Delete, &key, None, old);
        }
        Ok(())
    }

    /// Whether `key` exists, checking the cache first.
    pub async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        if let Some(cache) = &self.inner.cache {
            if cache.contains(key) {
                return Ok(true);
            }
        }
        let _shared = self.inner.tx_lock.read().await;
        let text = self.read_op(self.inner.backend.get_value(key)).await?;
        Ok(text.is_some())
    }

    /// All keys matching `regex`, in key order.
    pub async fn find_keys(&self, regex: &Regex) -> Result<Vec<String>> {
        let mut stream = self.stream().await?;
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, _) = entry.map_err(DatabaseError::read)?;
            if regex.is_match(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// All keys starting with `prefix`, in key order.
    pub async fn starts_with(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stream = self.stream().await?;
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, _) = entry.map_err(DatabaseError::read)?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Every entry, in key order.
    pub async fn get_all(&self) -> Result<Vec<(String, Value)>> {
        let mut stream = self.stream().await?;
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            entries.push(entry.map_err(DatabaseError::read)?);
        }
        Ok(entries)
    }

    /// Every key, in key order.
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.get_all().await?.into_iter().map(|(key, _)| key).collect())
    }

    /// Every value, in key order.
    pub async fn values(&self) -> Result<Vec<Value>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<usize> {
        let mut stream = self.stream().await?;
        let mut count = 0;
        while let Some(entry) = stream.next().await {
            entry.map_err(DatabaseError::read)?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// The backend's streaming iterator over all entries.
    pub async fn stream(&self) -> Result<EntryStream> {
        self.inner
            .backend
            .stream_entries()
            .await
            .map_err(DatabaseError::read)
    }

    /// Remove every entry and dispatch a `clear` event.
    pub async fn clear(&self) -> Result<()> {
        if let Some(batch) = &self.inner.batch {
            batch.clear();
        }
        {
            let _shared = self.inner.tx_lock.read().await;
            self.write_op(self.inner.backend.write_all(BTreeMap::new()))
                .await?;
        }
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        self.inner.watchers.notify(EventKind::Clear, "", None, None);
        Ok(())
    }

    /// Flush any pending batched writes.
    pub async fn flush(&self) -> Result<()> {
        if let Some(batch) = &self.inner.batch {
            batch.flush().await;
        }
        Ok(())
    }

    /// Tear the instance down: flush (or drop) pending writes, destroy the
    /// cache, clear watchers, and release the backend.
    pub async fn destroy(&self, flush: bool) -> Result<()> {
        if let Some(batch) = &self.inner.batch {
            if flush {
                batch.flush().await;
            } else {
                batch.clear();
            }
        }
        if let Some(cache) = &self.inner.cache {
            cache.destroy();
        }
        self.inner.watchers.clear();
        self.inner
            .backend
            .destroy()
            .await
            .map_err(DatabaseError::write)?;
        debug!(path = %self.inner.path.display(), "database destroyed");
        Ok(())
    }

    // ===== Queries =====

    /// Start building a query.
    #[must_use]
    pub fn query(&self) -> Query {
        Query::new(Arc::clone(&self.inner.backend))
    }

    // ===== Transactions =====

    /// Run `f` inside a backend atomic section. Pending batched writes are
    /// flushed first; the connection is held exclusively until commit or
    /// rollback. Requires a backend with transaction support.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.inner.backend.supports_transactions() {
            return Err(DatabaseError::Transaction(anyhow::anyhow!(
                "{} backend does not support transactions",
                self.inner.backend.name()
            )));
        }
        self.flush().await?;
        let Ok(_exclusive) = self.inner.tx_lock.try_write() else {
            return Err(DatabaseError::Transaction(anyhow::anyhow!(
                "a transaction is already in progress on this connection"
            )));
        };
        transaction::run(
            Arc::clone(&self.inner.backend),
            self.inner.cache.clone(),
            f,
        )
        .await
    }

    // ===== Watchers =====

    /// Register a watcher; `pattern` is an exact key, a `*` glob, or a
    /// regex. The callback runs synchronously on every matching mutation.
    pub fn watch(
        &self,
        pattern: impl Into<WatchPattern>,
        callback: WatchCallback,
    ) -> Result<WatcherId> {
        self.inner
            .watchers
            .watch(pattern, callback)
            .map_err(|err| DatabaseError::InvalidValue(err.to_string()))
    }

    /// Deregister a watcher.
    pub fn unwatch(&self, id: WatcherId) -> bool {
        self.inner.watchers.unwatch(id)
    }

    /// Drop every watcher.
    pub fn clear_watchers(&self) {
        self.inner.watchers.clear();
    }

    /// Subscribe to the global mutation event channel.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watchers.subscribe_events()
    }

    /// Subscribe to watcher callback failure reports.
    #[must_use]
    pub fn subscribe_watcher_errors(&self) -> broadcast::Receiver<WatcherError> {
        self.inner.watchers.subscribe_errors()
    }

    // ===== Statistics =====

    /// Snapshot of façade counters, cache statistics, and queue depth.
    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            reads: self.inner.counters.reads.load(Ordering::Relaxed),
            writes: self.inner.counters.writes.load(Ordering::Relaxed),
            deletes: self.inner.counters.deletes.load(Ordering::Relaxed),
            cache: self.inner.cache.as_ref().map(|cache| cache.stats()),
            batch_queue: self.inner.batch.as_ref().map_or(0, |batch| batch.len()),
        }
    }

    /// Zero all counters, including the cache's.
    pub fn reset_stats(&self) {
        self.inner.counters.reads.store(0, Ordering::Relaxed);
        self.inner.counters.writes.store(0, Ordering::Relaxed);
        self.inner.counters.deletes.store(0, Ordering::Relaxed);
        if let Some(cache) = &self.inner.cache {
            cache.reset_stats();
        }
    }

    // ===== Internals =====

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    pub(crate) fn cache(&self) -> Option<&Arc<Cache>> {
        self.inner.cache.as_ref()
    }

    pub(crate) fn tx_lock(&self) -> &Arc<RwLock<()>> {
        &self.inner.tx_lock
    }

    fn cached_old(&self, key: &str) -> Option<Value> {
        self.inner.cache.as_ref().and_then(|cache| cache.peek(key))
    }

    /// Route a write through the coalescer or straight to the backend,
    /// then update the cache.
    async fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = codec::encode(value);
        if let Some(batch) = &self.inner.batch {
            batch
                .submit(BatchOp {
                    key: key.to_string(),
                    value: encoded,
                })
                .await
                .map_err(map_batch_error)?;
        } else {
            let _shared = self.inner.tx_lock.read().await;
            self.write_op(self.inner.backend.set_value(key, &encoded))
                .await?;
        }
        if let Some(cache) = &self.inner.cache {
            cache.set(key, value.clone(), None);
        }
        Ok(())
    }

    /// Run a backend read under the session timeout.
    async fn read_op<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        let deadline = self.inner.options.timeout_duration();
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DatabaseError::read(err)),
            Err(_) => {
                self.handle_timeout().await;
                Err(DatabaseError::Timeout(deadline))
            }
        }
    }

    /// Run a backend write under the session timeout.
    async fn write_op<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        let deadline = self.inner.options.timeout_duration();
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DatabaseError::write(err)),
            Err(_) => {
                self.handle_timeout().await;
                Err(DatabaseError::Timeout(deadline))
            }
        }
    }

    /// Unless configured to keep the connection open, cycle the backend
    /// after a timeout so the next operation starts from a clean state.
    async fn handle_timeout(&self) {
        if self.inner.options.keep_connection_open {
            return;
        }
        warn!("operation timed out; cycling backend connection");
        if let Err(err) = self.inner.backend.destroy().await {
            warn!(%err, "backend close failed after timeout");
        }
        if let Err(err) = self.inner.backend.connect().await {
            warn!(%err, "backend reopen failed after timeout");
        }
    }
}

fn map_batch_error(err: BatchError) -> DatabaseError {
    match err {
        BatchError::Timeout(duration) => DatabaseError::Timeout(duration),
        other => DatabaseError::Write(anyhow::Error::new(other)),
    }
}
