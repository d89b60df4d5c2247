//! SQLite table backend.
//!
//! A single `data(key TEXT PRIMARY KEY, value TEXT NOT NULL)` table with a
//! secondary index on `key`. All statements go through the prepared-statement
//! cache; batches run inside one transaction. Connection setup enables WAL
//! journaling (configurable), NORMAL synchronous mode, an in-memory temp
//! store, and a 64 MiB page cache.
//!
//! SQLite work is synchronous, so every operation hops onto the blocking
//! pool via `spawn_blocking`; the connection itself lives behind a mutex
//! shared with those blocking closures.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::codec;
use crate::traits::{EntryStream, StorageBackend};
use crate::value::Value;

/// Rows fetched per chunk by the streaming scan.
const STREAM_CHUNK_SIZE: usize = 512;

const SQL_GET: &str = "SELECT value FROM data WHERE key = ?1";
const SQL_SET: &str =
    "INSERT INTO data (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value";
const SQL_DELETE: &str = "DELETE FROM data WHERE key = ?1";
const SQL_READ_ALL: &str = "SELECT key, value FROM data ORDER BY key";
const SQL_CHUNK_FIRST: &str = "SELECT key, value FROM data ORDER BY key LIMIT ?1";
const SQL_CHUNK_AFTER: &str = "SELECT key, value FROM data WHERE key > ?1 ORDER BY key LIMIT ?2";

type ConnHandle = Arc<Mutex<Option<Connection>>>;

/// Relational-table storage backend.
pub struct SqliteBackend {
    path: PathBuf,
    wal_mode: bool,
    conn: ConnHandle,
}

impl SqliteBackend {
    /// Create a backend for `path`. The connection opens on
    /// [`StorageBackend::connect`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, wal_mode: bool) -> Self {
        Self {
            path: path.into(),
            wal_mode,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn setup_sql(&self) -> String {
        format!(
            concat!(
                "{}",
                "PRAGMA synchronous=NORMAL;",
                "PRAGMA temp_store=memory;",
                "PRAGMA cache_size=-65536;",
                "CREATE TABLE IF NOT EXISTS data (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
                "CREATE INDEX IF NOT EXISTS data_key_idx ON data (key);",
            ),
            if self.wal_mode {
                "PRAGMA journal_mode=WAL;"
            } else {
                ""
            }
        )
    }

    /// Run `f` with the open connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let handle = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = handle.lock();
            let conn = guard.as_mut().context("database connection is closed")?;
            f(conn)
        })
        .await
        .map_err(|err| anyhow!("blocking task failed: {err}"))?
    }
}

fn fetch_chunk(conn: &Connection, after: Option<&str>) -> Result<Vec<(String, String)>> {
    let mut stmt = match after {
        Some(_) => conn.prepare_cached(SQL_CHUNK_AFTER)?,
        None => conn.prepare_cached(SQL_CHUNK_FIRST)?,
    };
    let chunk_len = STREAM_CHUNK_SIZE as i64;
    let mut rows = match after {
        Some(key) => stmt.query(params![key, chunk_len])?,
        None => stmt.query(params![chunk_len])?,
    };
    let mut out = Vec::with_capacity(STREAM_CHUNK_SIZE);
    while let Some(row) = rows.next()? {
        out.push((row.get(0)?, row.get(1)?));
    }
    Ok(out)
}

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

struct StreamState {
    conn: ConnHandle,
    last_key: Option<String>,
    buffer: VecDeque<(String, Value)>,
    done: bool,
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn connect(&self) -> Result<()> {
        let path = self.path.clone();
        let setup = self.setup_sql();
        let handle = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            conn.execute_batch(&setup)
                .context("failed to initialize database schema")?;
            *handle.lock() = Some(conn);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|err| anyhow!("blocking task failed: {err}"))??;
        debug!(path = %self.path.display(), wal = self.wal_mode, "sqlite backend connected");
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(SQL_GET)?;
            Ok(stmt
                .query_row(params![key], |row| row.get::<_, String>(0))
                .optional()?)
        })
        .await
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(SQL_SET)?;
            stmt.execute(params![key, value])?;
            Ok(())
        })
        .await
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(SQL_DELETE)?;
            Ok(stmt.execute(params![key])? > 0)
        })
        .await
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(SQL_READ_ALL)?;
            let mut rows = stmt.query([])?;
            let mut out = BTreeMap::new();
            while let Some(row) = rows.next()? {
                out.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
            }
            Ok(out)
        })
        .await
    }

    async fn write_all(&self, entries: BTreeMap<String, String>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM data", [])?;
            {
                let mut stmt = tx.prepare_cached(SQL_SET)?;
                for (key, value) in &entries {
                    stmt.execute(params![key, value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn batch_set(&self, batch: Vec<(String, String)>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(SQL_SET)?;
                for (key, value) in &batch {
                    stmt.execute(params![key, value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(SQL_DELETE)?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn stream_entries(&self) -> Result<EntryStream> {
        // Chunked keyset pagination: the connection lock is held only while
        // a chunk is fetched, never across consumer suspension points.
        let state = StreamState {
            conn: Arc::clone(&self.conn),
            last_key: None,
            buffer: VecDeque::new(),
            done: false,
        };
        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some((key, value)) = state.buffer.pop_front() {
                    return Some((Ok((key, value)), state));
                }
                if state.done {
                    return None;
                }
                let handle = Arc::clone(&state.conn);
                let after = state.last_key.clone();
                let chunk = tokio::task::spawn_blocking(move || {
                    let mut guard = handle.lock();
                    let conn = guard.as_mut().context("database connection is closed")?;
                    fetch_chunk(conn, after.as_deref())
                })
                .await
                .map_err(|err| anyhow!("blocking task failed: {err}"))
                .and_then(|res| res);
                match chunk {
                    Ok(rows) => {
                        if rows.len() < STREAM_CHUNK_SIZE {
                            state.done = true;
                        }
                        if let Some((key, _)) = rows.last() {
                            state.last_key = Some(key.clone());
                        }
                        state
                            .buffer
                            .extend(rows.into_iter().map(|(key, text)| {
                                let value = codec::decode_entry(&key, &text);
                                (key, value)
                            }));
                        if state.buffer.is_empty() && state.done {
                            return None;
                        }
                    }
                    Err(err) => {
                        state.done = true;
                        state.buffer.clear();
                        return Some((Err(err), state));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        descending: bool,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<Vec<(String, Value)>>> {
        let pattern = format!("{}%", escape_like(prefix));
        let sql = if descending {
            "SELECT key, value FROM data WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key DESC LIMIT ?2 OFFSET ?3"
        } else {
            "SELECT key, value FROM data WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC LIMIT ?2 OFFSET ?3"
        };
        let limit = limit.map_or(-1, |l| l as i64);
        let offset = offset as i64;
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let mut rows = stmt.query(params![pattern, limit, offset])?;
                let mut out: Vec<(String, String)> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await?;
        Ok(Some(
            rows.into_iter()
                .map(|(key, text)| {
                    let value = codec::decode_entry(&key, &text);
                    (key, value)
                })
                .collect(),
        ))
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")
                .context("failed to open transaction")
        })
        .await
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("COMMIT").context("failed to commit"))
            .await
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("ROLLBACK").context("failed to roll back"))
            .await
    }

    async fn destroy(&self) -> Result<()> {
        let handle = Arc::clone(&self.conn);
        let conn = tokio::task::spawn_blocking(move || handle.lock().take())
            .await
            .map_err(|err| anyhow!("blocking task failed: {err}"))?;
        if let Some(conn) = conn {
            // Closing flushes the WAL; do it off the async thread as well.
            tokio::task::spawn_blocking(move || drop(conn))
                .await
                .map_err(|err| anyhow!("blocking task failed: {err}"))?;
        }
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{suffix}", self.path.display()));
            if tokio::fs::remove_file(&sidecar).await.is_ok() {
                warn!(file = %sidecar.display(), "removed leftover sidecar file");
            }
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn temp_backend() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path().join("store.db"), true);
        backend.connect().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let (_dir, backend) = temp_backend().await;
        backend.set_value("a", "1").await.unwrap();
        backend.set_value("a", "2").await.unwrap();
        assert_eq!(backend.get_value("a").await.unwrap(), Some("2".to_string()));
        assert!(backend.delete_value("a").await.unwrap());
        assert!(!backend.delete_value("a").await.unwrap());
    }

    #[tokio::test]
    async fn batch_set_is_atomic_and_ordered() {
        let (_dir, backend) = temp_backend().await;
        let entries: Vec<(String, String)> = (0..10)
            .map(|i| (format!("k{i:02}"), i.to_string()))
            .collect();
        backend.batch_set(entries).await.unwrap();
        let all = backend.read_all().await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all.get("k03"), Some(&"3".to_string()));
    }

    #[tokio::test]
    async fn stream_paginates_in_key_order() {
        let (_dir, backend) = temp_backend().await;
        let entries: Vec<(String, String)> = (0..1200)
            .map(|i| (format!("k{i:04}"), "0".to_string()))
            .collect();
        backend.batch_set(entries).await.unwrap();

        let mut stream = backend.stream_entries().await.unwrap();
        let mut count = 0;
        let mut last = String::new();
        while let Some(entry) = stream.next().await {
            let (key, _) = entry.unwrap();
            assert!(key > last, "stream out of order at {key}");
            last = key;
            count += 1;
        }
        assert_eq!(count, 1200);
    }

    #[tokio::test]
    async fn scan_prefix_pushes_down_limit_and_offset() {
        let (_dir, backend) = temp_backend().await;
        let mut entries: Vec<(String, String)> =
            (0..20).map(|i| (format!("user:{i:02}"), "0".to_string())).collect();
        entries.push(("other:1".to_string(), "0".to_string()));
        backend.batch_set(entries).await.unwrap();

        let rows = backend
            .scan_prefix("user:", false, Some(5), 2)
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["user:02", "user:03", "user:04", "user:05", "user:06"]);

        let rows = backend
            .scan_prefix("user:", true, Some(2), 0)
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["user:19", "user:18"]);
    }

    #[tokio::test]
    async fn like_metacharacters_do_not_widen_the_scan() {
        let (_dir, backend) = temp_backend().await;
        backend.set_value("a_b", "1").await.unwrap();
        backend.set_value("axb", "2").await.unwrap();
        let rows = backend
            .scan_prefix("a_", false, None, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().map(|(k, _)| k.as_str()), Some("a_b"));
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let (_dir, backend) = temp_backend().await;
        backend.set_value("kept", "1").await.unwrap();

        backend.begin_transaction().await.unwrap();
        backend.set_value("discarded", "2").await.unwrap();
        backend.rollback_transaction().await.unwrap();

        assert_eq!(backend.get_value("discarded").await.unwrap(), None);
        assert_eq!(
            backend.get_value("kept").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn decode_failure_yields_raw_text() {
        let (_dir, backend) = temp_backend().await;
        backend.set_value("bad", "not json {").await.unwrap();
        let mut stream = backend.stream_entries().await.unwrap();
        let (key, value) = stream.next().await.unwrap().unwrap();
        assert_eq!(key, "bad");
        assert_eq!(value, Value::String("not json {".to_string()));
    }
}
