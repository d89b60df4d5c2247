//! Shared test infrastructure: temp-dir database fixtures, unique keys,
//! and tracing setup.

// Not every test binary uses every helper.
#![allow(dead_code)]

use quickdb::{Database, Options};
use tempfile::TempDir;

/// Install the test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Create a unique test key to avoid cross-test collisions.
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Open a table-backend database in its own temp dir.
pub async fn open_sqlite(options: Options) -> (TempDir, Database) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_with_options(dir.path().join("store.db"), options)
        .await
        .expect("open sqlite database");
    (dir, db)
}

/// Open a document-backend database in its own temp dir.
pub async fn open_json(options: Options) -> (TempDir, Database) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_with_options(dir.path().join("store.json"), options)
        .await
        .expect("open json database");
    (dir, db)
}

/// Options with batching disabled, for tests that need direct writes.
pub fn direct_options() -> Options {
    Options::default().with_batch(false)
}
