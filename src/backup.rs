//! Streaming backup and validated restore.
//!
//! A backup is one JSON document `{version, timestamp, data, entries}`
//! written entry by entry from the backend's stream, never materializing
//! the whole map in memory, with owner-only permissions where supported.
//! Restore validates the envelope before anything touches the backend and
//! replaces (or merges into) the store atomically via `write_all`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use regex::Regex;
use serde_json::Map;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::codec;
use crate::database::Database;
use crate::error::{DatabaseError, Result};
use crate::validate::validate_key;

/// Files larger than this restore through an incremental reader instead of
/// one in-memory string.
const STREAMING_PARSE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Overall restore deadline.
const RESTORE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Envelope metadata of one backup file.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Filename component.
    pub file: String,
    /// Full path.
    pub path: PathBuf,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub entries: u64,
    /// File size in bytes.
    pub size: u64,
}

/// Restore behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Union the backup with current contents instead of replacing them;
    /// incoming entries win on conflict.
    pub merge: bool,
}

fn version_pattern() -> Regex {
    // Infallible: the pattern is a literal.
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^\d+\.\d+\.\d+$").unwrap()
}

impl Database {
    /// Write a snapshot of the whole store to `path`. Pending batched
    /// writes are flushed first. Returns the number of entries written.
    pub async fn backup(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.flush().await?;

        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))
            .map_err(DatabaseError::write)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(DatabaseError::write)?;
        }
        let mut writer = BufWriter::new(file);

        let header = format!(
            "{{\"version\":{},\"timestamp\":{},\"data\":{{",
            serde_json::Value::String(env!("CARGO_PKG_VERSION").to_string()),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        writer
            .write_all(header.as_bytes())
            .await
            .map_err(DatabaseError::write)?;

        let mut stream = self.stream().await?;
        let mut entries: u64 = 0;
        while let Some(entry) = stream.next().await {
            let (key, value) = entry.map_err(DatabaseError::read)?;
            let mut chunk = String::new();
            if entries > 0 {
                chunk.push(',');
            }
            chunk.push_str(&serde_json::Value::String(key).to_string());
            chunk.push(':');
            chunk.push_str(&codec::encode(&value));
            writer
                .write_all(chunk.as_bytes())
                .await
                .map_err(DatabaseError::write)?;
            entries += 1;
        }

        let footer = format!("}},\"entries\":{entries}}}");
        writer
            .write_all(footer.as_bytes())
            .await
            .map_err(DatabaseError::write)?;
        writer.flush().await.map_err(DatabaseError::write)?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(DatabaseError::write)?;

        info!(path = %path.display(), entries, "backup written");
        Ok(entries)
    }

    /// Restore the store from a backup written by [`Database::backup`].
    /// Returns the number of entries now in the backend.
    pub async fn restore(
        &self,
        path: impl AsRef<Path>,
        options: RestoreOptions,
    ) -> Result<usize> {
        let path = path.as_ref().to_path_buf();
        let deadline = RESTORE_TIMEOUT;
        match tokio::time::timeout(deadline, self.restore_inner(&path, options)).await {
            Ok(result) => result,
            Err(_) => Err(DatabaseError::Timeout(deadline)),
        }
    }

    async fn restore_inner(&self, path: &Path, options: RestoreOptions) -> Result<usize> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))
            .map_err(DatabaseError::read)?
            .len();

        let envelope: serde_json::Value = if size > STREAMING_PARSE_THRESHOLD {
            debug!(size, "restore using incremental parse");
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let file = std::fs::File::open(&path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader).context("backup file is not valid JSON")
            })
            .await
            .map_err(|err| DatabaseError::read(anyhow::anyhow!("blocking task failed: {err}")))?
            .map_err(DatabaseError::read)?
        } else {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))
                .map_err(DatabaseError::read)?;
            serde_json::from_str(&text)
                .context("backup file is not valid JSON")
                .map_err(DatabaseError::read)?
        };

        let data = validate_envelope(&envelope)?;

        let mut incoming = std::collections::BTreeMap::new();
        for (key, value) in data {
            incoming.insert(key.clone(), value.to_string());
        }

        let _shared = self.tx_lock().read().await;
        let to_restore = if options.merge {
            let mut merged = self
                .backend()
                .read_all()
                .await
                .map_err(DatabaseError::read)?;
            merged.extend(incoming);
            merged
        } else {
            incoming
        };
        let restored = to_restore.len();

        self.backend()
            .write_all(to_restore)
            .await
            .map_err(DatabaseError::write)?;
        if let Some(cache) = self.cache() {
            cache.clear();
        }
        info!(path = %path.display(), restored, merge = options.merge, "restore complete");
        Ok(restored)
    }

    /// Enumerate valid backup files in `dir`, newest first. Files that are
    /// not valid backups are skipped with a warning.
    pub async fn list_backups(&self, dir: impl AsRef<Path>) -> Result<Vec<BackupInfo>> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot read directory {}", dir.display()))
            .map_err(DatabaseError::read)?;

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(DatabaseError::read)?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_backup_info(&path).await {
                Ok(info) => backups.push(info),
                Err(err) => {
                    warn!(file = %path.display(), %err, "skipping invalid backup file");
                }
            }
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }
}

/// Check the envelope shape and return the data mapping.
fn validate_envelope(
    envelope: &serde_json::Value,
) -> Result<&Map<String, serde_json::Value>> {
    let fields = envelope
        .as_object()
        .ok_or_else(|| DatabaseError::InvalidValue("backup envelope is not a mapping".to_string()))?;

    let version = fields
        .get("version")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DatabaseError::InvalidValue("backup is missing a version".to_string()))?;
    if !version_pattern().is_match(version) {
        return Err(DatabaseError::InvalidValue(format!(
            "backup version '{version}' is not MAJOR.MINOR.PATCH"
        )));
    }

    let timestamp = fields
        .get("timestamp")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DatabaseError::InvalidValue("backup is missing a timestamp".to_string()))?;
    DateTime::parse_from_rfc3339(timestamp).map_err(|_| {
        DatabaseError::InvalidValue(format!("backup timestamp '{timestamp}' is not an instant"))
    })?;

    let data = fields
        .get("data")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| DatabaseError::InvalidValue("backup data is not a mapping".to_string()))?;

    if let Some(declared) = fields.get("entries") {
        let declared = declared.as_u64().ok_or_else(|| {
            DatabaseError::InvalidValue("backup entry count is not an integer".to_string())
        })?;
        if declared != data.len() as u64 {
            return Err(DatabaseError::InvalidValue(format!(
                "backup declares {declared} entries but data holds {}",
                data.len()
            )));
        }
    }

    for (key, value) in data {
        validate_key(key)?;
        if codec::from_json(value).is_undefined() {
            return Err(DatabaseError::InvalidValue(format!(
                "backup value for key '{key}' is undefined"
            )));
        }
    }
    Ok(data)
}

async fn read_backup_info(path: &Path) -> anyhow::Result<BackupInfo> {
    let size = tokio::fs::metadata(path).await?.len();
    let text = tokio::fs::read_to_string(path).await?;
    let envelope: serde_json::Value = serde_json::from_str(&text)?;
    let data = validate_envelope(&envelope).map_err(|err| anyhow::anyhow!("{err}"))?;

    let fields = envelope
        .as_object()
        .context("envelope is not a mapping")?;
    let version = fields
        .get("version")
        .and_then(serde_json::Value::as_str)
        .context("missing version")?
        .to_string();
    let timestamp = fields
        .get("timestamp")
        .and_then(serde_json::Value::as_str)
        .context("missing timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)?.with_timezone(&Utc);
    let entries = fields
        .get("entries")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(data.len() as u64);

    Ok(BackupInfo {
        file: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string(),
        path: path.to_path_buf(),
        version,
        timestamp,
        entries,
        size,
    })
}
