//! quickdb
//!
//! An embedded, single-process, asynchronous key-value store featuring:
//! - **Two interchangeable backends**: a JSON document file and a SQLite
//!   table file, selected by filename extension
//! - **Type-preserving values**: dates, regexes, byte buffers, big
//!   integers, sets, maps, typed arrays, and error descriptors round-trip
//!   exactly
//! - **LRU+TTL cache**: bounded by entry count and estimated memory
//! - **Write batching**: writes coalesce into bounded partitions with
//!   deadline-based flushing and bounded retry
//! - **Transactions**: atomic multi-operation sections with cache
//!   reconciliation (table backend)
//! - **Watchers**: pattern-matched change notifications with rate limiting
//!   and error isolation
//! - **Query planner**: fused prefix/regex/predicate filtering, sort,
//!   offset, limit over a streaming scan, with backend push-down
//! - **Backup/restore**: streaming snapshots with envelope validation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quickdb::{Database, Value};
//!
//! #[tokio::main]
//! async fn main() -> quickdb::Result<()> {
//!     let db = Database::open("app.db").await?;
//!
//!     db.set("user:1", Value::object([("name", Value::from("alice"))])).await?;
//!     let user = db.get("user:1").await?;
//!     println!("stored: {user:?}");
//!
//!     let adults = db.query()
//!         .prefix("user:")
//!         .filter("age", quickdb::FilterOp::Ge, 18)
//!         .sort("age", quickdb::SortOrder::Desc)
//!         .limit(10)
//!         .get()
//!         .await?;
//!     println!("{} matches", adults.len());
//!
//!     db.destroy(true).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! caller → Database (façade) → Cache (reads) / BatchProcessor (writes)
//!              ↓ notify                ↓ flush
//!          WatcherManager        StorageBackend (json file | sqlite)
//! ```

pub mod backends;
pub mod backup;
pub mod batch;
pub mod cache;
pub mod codec;
pub mod database;
pub mod error;
pub mod options;
pub mod query;
pub mod traits;
pub mod transaction;
pub mod validate;
pub mod value;
pub mod watcher;

pub use backup::{BackupInfo, RestoreOptions};
pub use cache::CacheStats;
pub use database::{Database, DatabaseStats};
pub use error::{DatabaseError, Result};
pub use options::Options;
pub use query::{FilterOp, Query, QueryRow, SortOrder};
pub use traits::{EntryStream, StorageBackend};
pub use transaction::Transaction;
pub use validate::BackendKind;
pub use value::{TypedArrayKind, Value};
pub use watcher::{EventKind, WatchCallback, WatchEvent, WatchPattern, WatcherError, WatcherId};

// Re-export async_trait for custom backend implementations.
pub use async_trait::async_trait;
