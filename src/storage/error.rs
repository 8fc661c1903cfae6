//! Storage-specific error types.
//!
//! All storage, ingestion and query operations return [`StorageError`] on
//! failure. [`StorageError::class`] folds every variant into one of three
//! outcomes callers act on: reject the input, retry later, or treat the
//! storage subsystem as unavailable.

use std::path::PathBuf;

use rusqlite::ErrorCode;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// How a caller should react to a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorClass {
    /// Malformed or out-of-policy input. Nothing was written.
    Invalid,
    /// Transient contention or resource exhaustion. The whole operation may
    /// be resubmitted.
    Retryable,
    /// Corruption, I/O failure or schema mismatch.
    Fatal,
}

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database file could not be opened or prepared for use.
    #[error("storage unavailable at '{path}': {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// Database operation failed (rusqlite error).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection became available in time.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The file lock stayed contended through every retry.
    #[error("database busy after {attempts} attempts: {source}")]
    Busy {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// The file carries a schema this build does not understand.
    #[error("schema version mismatch: file has {found}, this build supports {supported}")]
    SchemaMismatch { found: i64, supported: i64 },

    /// Input rejected before any write was attempted.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to send command to the maintenance actor.
    #[error("failed to send command to maintenance actor")]
    ChannelSend,

    /// Internal error (e.g., task join failure).
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Classify this error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Invalid(_) => ErrorClass::Invalid,
            Self::Busy { .. } | Self::Pool(_) => ErrorClass::Retryable,
            Self::Database(e) if is_lock_contention(e) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this is a lock-contention signal from SQLite that the engine
    /// retries internally.
    pub(crate) fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Database(e) if is_lock_contention(e))
    }

    /// Convert a contention error into [`StorageError::Busy`] once the retry
    /// budget is spent.
    pub(crate) fn into_busy(self, attempts: u32) -> Self {
        match self {
            Self::Database(source) => Self::Busy { attempts, source },
            other => other,
        }
    }
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED` (including their extended codes such as
/// `SQLITE_BUSY_SNAPSHOT`) mean another connection holds a conflicting lock.
fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
