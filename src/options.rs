//! Database configuration options.
//!
//! All fields have defaults; [`Options::validate`] enforces the constraints
//! before the database opens. The struct also deserializes from JSON with
//! unknown keys rejected, for callers that load configuration from a file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, Result};

/// Tunables accepted by [`crate::Database::open_with_options`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Options {
    /// Enable the read cache.
    pub cache: bool,
    /// Maximum cached entries.
    pub cache_size: usize,
    /// Cache entry TTL in milliseconds; 0 disables expiry.
    pub cache_ttl: u64,
    /// Cache memory budget in MiB.
    #[serde(rename = "cacheMaxMemoryMB")]
    pub cache_max_memory_mb: f64,
    /// Enable write batching.
    pub batch: bool,
    /// Operations per batch partition.
    pub batch_size: usize,
    /// Batch deadline in milliseconds.
    pub batch_delay: u64,
    /// Batch executor timeout in milliseconds.
    pub operation_timeout: u64,
    /// Keep the backend connection open after a timeout.
    pub keep_connection_open: bool,
    /// Per-operation backend timeout in milliseconds.
    pub timeout: u64,
    /// Enable WAL journaling (table backend only).
    pub wal_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache: true,
            cache_size: 1000,
            cache_ttl: 0,
            cache_max_memory_mb: 100.0,
            batch: true,
            batch_size: 100,
            batch_delay: 50,
            operation_timeout: 30_000,
            keep_connection_open: true,
            timeout: 5000,
            wal_mode: true,
        }
    }
}

impl Options {
    /// Check every constraint; called once on open.
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(DatabaseError::InvalidValue(
                "cacheSize must be a positive integer".to_string(),
            ));
        }
        if !(self.cache_max_memory_mb.is_finite() && self.cache_max_memory_mb > 0.0) {
            return Err(DatabaseError::InvalidValue(
                "cacheMaxMemoryMB must be a positive number".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DatabaseError::InvalidValue(
                "batchSize must be a positive integer".to_string(),
            ));
        }
        if self.operation_timeout == 0 {
            return Err(DatabaseError::InvalidValue(
                "operationTimeout must be a positive integer".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(DatabaseError::InvalidValue(
                "timeout must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache TTL as a duration; `None` when expiry is disabled.
    #[must_use]
    pub fn cache_ttl_duration(&self) -> Option<Duration> {
        (self.cache_ttl > 0).then(|| Duration::from_millis(self.cache_ttl))
    }

    /// Cache memory budget in bytes.
    #[must_use]
    pub fn cache_max_memory_bytes(&self) -> usize {
        (self.cache_max_memory_mb * 1024.0 * 1024.0) as usize
    }

    /// Per-operation backend timeout.
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    // Fluent setters, builder style.

    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    #[must_use]
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl = ttl_ms;
        self
    }

    #[must_use]
    pub fn with_cache_max_memory_mb(mut self, mb: f64) -> Self {
        self.cache_max_memory_mb = mb;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, enabled: bool) -> Self {
        self.batch = enabled;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn with_batch_delay(mut self, delay_ms: u64) -> Self {
        self.batch_delay = delay_ms;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_keep_connection_open(mut self, keep: bool) -> Self {
        self.keep_connection_open = keep;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_wal_mode(mut self, enabled: bool) -> Self {
        self.wal_mode = enabled;
        self
    }
}
