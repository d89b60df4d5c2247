//! Persistence backend implementations.
//!
//! Two concrete variants implement [`crate::traits::StorageBackend`]:
//!
//! - [`JsonFileBackend`]: the whole store lives in one JSON document;
//!   every mutation rewrites the file atomically. No transaction support.
//! - [`SqliteBackend`]: a single `data(key, value)` table driven through
//!   prepared statements, with WAL journaling and atomic batch sections.
//!
//! The database filename extension selects the variant; see
//! [`crate::validate::resolve_backend`].

pub mod json_file;
pub mod sqlite;

pub use json_file::JsonFileBackend;
pub use sqlite::SqliteBackend;
