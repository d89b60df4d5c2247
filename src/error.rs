//! Error taxonomy for the database.
//!
//! Every failure surfaced by the public API maps onto one of the variants
//! below. Backend-internal errors travel as [`anyhow::Error`] and are wrapped
//! into a category at the façade boundary, so `std::io` and SQLite error
//! types never leak through the public surface.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// All error categories surfaced by the database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The key failed admission validation (empty, too long, forbidden
    /// characters, not in NFC form).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The value failed admission validation.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A backend read failed.
    #[error("read failed: {0}")]
    Read(#[source] anyhow::Error),

    /// A backend write failed. Connection-establishment failures also use
    /// this category, with a "Connection failed" message.
    #[error("write failed: {0}")]
    Write(#[source] anyhow::Error),

    /// An array operation (`push`, `pull`) targeted a non-array value.
    #[error("value at key '{0}' is not an array")]
    NotArray(String),

    /// A numeric operation (`add`, `subtract`) targeted a non-numeric value
    /// or was given a non-finite amount.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// A transaction callback or commit failed. The backend and cache have
    /// been rolled back before this is raised.
    #[error("transaction failed: {0}")]
    Transaction(#[source] anyhow::Error),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl DatabaseError {
    /// Wrap a backend read error.
    pub(crate) fn read(err: impl Into<anyhow::Error>) -> Self {
        Self::Read(err.into())
    }

    /// Wrap a backend write error.
    pub(crate) fn write(err: impl Into<anyhow::Error>) -> Self {
        Self::Write(err.into())
    }

    /// Wrap a connection-establishment failure.
    pub(crate) fn connection(err: impl Into<anyhow::Error>) -> Self {
        Self::Write(err.into().context("Connection failed"))
    }
}
