//! Storage backend contract.
//!
//! This module defines the trait every persistence backend must uphold. The
//! façade and the query planner speak only through this trait, which keeps
//! the two concrete variants (JSON document file, SQLite table file)
//! interchangeable.
//!
//! Backends exchange *encoded* value text (see [`crate::codec`]); decoding
//! to [`Value`] happens only on the streaming paths, where a single
//! undecodable row must be yielded as raw text rather than aborting the
//! stream.

use std::collections::BTreeMap;
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;

use crate::value::Value;

/// A lazily produced sequence of `(key, decoded value)` entries in key order.
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<(String, Value)>> + Send>>;

/// Core persistence contract shared by both backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the façade shares one backend
/// instance across concurrent tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Establish the backing file / connection. Called once by the façade
    /// before any other operation.
    async fn connect(&self) -> Result<()>;

    /// Read the encoded value stored under `key`.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Store the encoded value under `key`, replacing any previous value.
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Returns whether an entry existed.
    async fn delete_value(&self, key: &str) -> Result<bool>;

    /// Read the entire store as a key-ordered map of encoded values.
    async fn read_all(&self) -> Result<BTreeMap<String, String>>;

    /// Atomically replace the entire store with `entries`.
    async fn write_all(&self, entries: BTreeMap<String, String>) -> Result<()>;

    /// Store a group of entries as one atomic unit.
    async fn batch_set(&self, entries: Vec<(String, String)>) -> Result<()>;

    /// Remove a group of keys as one atomic unit.
    async fn batch_delete(&self, keys: Vec<String>) -> Result<()>;

    /// Stream all entries in key order. Per-row decode failures yield the
    /// raw encoded text as a string value; iteration-level failures abort
    /// the stream with an error item.
    async fn stream_entries(&self) -> Result<EntryStream>;

    /// Push-down hook for prefix-ranged scans, key-ordered. `Ok(None)`
    /// means the backend does not support push-down and the caller must
    /// fall back to [`StorageBackend::stream_entries`].
    async fn scan_prefix(
        &self,
        _prefix: &str,
        _descending: bool,
        _limit: Option<usize>,
        _offset: usize,
    ) -> Result<Option<Vec<(String, Value)>>> {
        Ok(None)
    }

    /// Open a backend-level atomic section with immediate write intent.
    /// Only meaningful when [`StorageBackend::supports_transactions`] is
    /// true.
    async fn begin_transaction(&self) -> Result<()> {
        anyhow::bail!("{} backend does not support transactions", self.name())
    }

    /// Commit the open atomic section.
    async fn commit_transaction(&self) -> Result<()> {
        anyhow::bail!("{} backend does not support transactions", self.name())
    }

    /// Roll back the open atomic section.
    async fn rollback_transaction(&self) -> Result<()> {
        anyhow::bail!("{} backend does not support transactions", self.name())
    }

    /// Release the backing resources. Sidecar files (e.g. SQLite WAL) are
    /// removed on a best-effort basis; the data file itself is kept.
    async fn destroy(&self) -> Result<()>;

    /// Whether this backend provides atomic multi-operation sections.
    fn supports_transactions(&self) -> bool;

    /// Backend name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
