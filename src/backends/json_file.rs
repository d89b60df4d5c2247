//! JSON document-file backend.
//!
//! The entire key→value map is held in a single JSON document. Every
//! mutation loads the document, applies the change, and writes the file
//! back atomically (write to a temp file, fsync, rename over the original,
//! owner-only mode where the platform supports it). A mutex serializes
//! mutations so each write is atomic with respect to concurrent callers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::stream;
use serde_json::Map;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::codec;
use crate::traits::{EntryStream, StorageBackend};

/// Refuse to load documents larger than this.
pub const MAX_DOCUMENT_BYTES: u64 = 512 * 1024 * 1024;

/// Document-file storage backend.
pub struct JsonFileBackend {
    path: PathBuf,
    max_document_bytes: u64,
    /// Serializes load-mutate-store cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileBackend {
    /// Create a backend for `path`. No I/O happens until
    /// [`StorageBackend::connect`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_document_bytes: MAX_DOCUMENT_BYTES,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the document as a map of encoded value text.
    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                if meta.len() > self.max_document_bytes {
                    bail!(
                        "document file {} is {} bytes, larger than the {} byte load limit",
                        self.path.display(),
                        meta.len(),
                        self.max_document_bytes
                    );
                }
            }
            Err(_) => return Ok(BTreeMap::new()),
        }
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let document: Map<String, serde_json::Value> = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid JSON document", self.path.display()))?;
        Ok(document
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect())
    }

    /// Write the map back atomically.
    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut document = Map::new();
        for (key, text) in entries {
            // Stored text is JSON produced by the codec; embed it parsed so
            // the document stays one well-formed JSON object. Text that
            // slipped in unparseable is embedded as a plain string.
            let value = serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::Value::String(text.clone()));
            document.insert(key.clone(), value);
        }
        let body = serde_json::Value::Object(document).to_string();
        write_atomic(&self.path, body.as_bytes()).await
    }
}

/// Write `bytes` to `path` via a temp file in the same directory, fsync,
/// then rename. Owner-only mode on Unix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("path has no filename")?;
    let tmp_path = path.with_file_name(format!(
        "{file_name}.{}.{:08x}.tmp",
        std::process::id(),
        rand::random::<u32>()
    ));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        file.set_permissions(perms).await?;
    }
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for JsonFileBackend {
    async fn connect(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::metadata(&self.path).await.is_err() {
            debug!(path = %self.path.display(), "creating new document file");
            write_atomic(&self.path, b"{}").await?;
            return Ok(());
        }
        // Validate that the existing document loads.
        self.load().await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.remove(key))
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let existed = entries.remove(key).is_some();
        if existed {
            self.persist(&entries).await?;
        }
        Ok(existed)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        self.load().await
    }

    async fn write_all(&self, entries: BTreeMap<String, String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.persist(&entries).await
    }

    async fn batch_set(&self, batch: Vec<(String, String)>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        for (key, value) in batch {
            entries.insert(key, value);
        }
        self.persist(&entries).await
    }

    async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let mut changed = false;
        for key in keys {
            changed |= entries.remove(&key).is_some();
        }
        if changed {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn stream_entries(&self) -> Result<EntryStream> {
        let entries = self.load().await?;
        let items = entries
            .into_iter()
            .map(|(key, text)| {
                let value = codec::decode_entry(&key, &text);
                Ok((key, value))
            })
            .collect::<Vec<_>>();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn destroy(&self) -> Result<()> {
        // Nothing to release; the document file is the only state. Leftover
        // temp files from interrupted writes are cleaned opportunistically.
        if let Some(parent) = self.path.parent() {
            if let Ok(mut dir) = tokio::fs::read_dir(parent).await {
                while let Ok(Some(entry)) = dir.next_entry().await {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if name.starts_with(&format!(
                        "{}.",
                        self.path.file_name().and_then(|n| n.to_str()).unwrap_or("")
                    )) && name.ends_with(".tmp")
                    {
                        warn!(file = name, "removing stale temp file");
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "json-file"
    }
}
