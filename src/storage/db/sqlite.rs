//! SQLite backend implementation using rusqlite.
//!
//! Provides the transactional API every other component goes through.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::StorageError;
use crate::storage::pool::{ConnectionPools, configure_connection};
use crate::storage::retry::RetryPolicy;

/// Default bounded wait for the file lock inside SQLite's busy handler.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a free pooled connection.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default writer connections per process. Writes serialize on the file
/// lock anyway; a couple of connections keeps one request's commit from
/// queuing the next request's validation.
const DEFAULT_WRITE_POOL_SIZE: u32 = 2;

/// Default reader connections per process.
const DEFAULT_READ_POOL_SIZE: u32 = 4;

/// SQLite `synchronous` setting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum SynchronousMode {
    /// Durable against process crashes; the last commits may roll back on
    /// power loss.
    Normal,
    /// fsync on every commit.
    #[default]
    Full,
    /// `FULL` plus a directory sync.
    Extra,
}

/// WAL checkpoint mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

/// Result of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// The checkpoint could not finish because of concurrent readers/writers.
    pub busy: bool,
    /// Frames in the WAL.
    pub wal_frames: i64,
    /// Frames copied back into the database file.
    pub checkpointed: i64,
}

/// Engine options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Bounded wait for the file lock.
    pub busy_timeout: Duration,
    /// Retry ceiling and backoff applied on top of the busy wait.
    pub retry: RetryPolicy,
    /// Wait for a free pooled connection.
    pub acquire_timeout: Duration,
    pub write_pool_size: u32,
    pub read_pool_size: u32,
    pub synchronous: SynchronousMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retry: RetryPolicy::default(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            write_pool_size: DEFAULT_WRITE_POOL_SIZE,
            read_pool_size: DEFAULT_READ_POOL_SIZE,
            synchronous: SynchronousMode::default(),
        }
    }
}

/// Handle to the shared database file.
///
/// Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    pools: ConnectionPools,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if absent) the database file.
    ///
    /// # Configuration
    ///
    /// - WAL journal mode, persisted in the file
    /// - `busy_timeout` on every connection
    /// - writer and `query_only` reader pools
    ///
    /// If a previous process crashed mid-transaction, SQLite rolls the
    /// uncommitted WAL frames back on the first connection; nothing to do here.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let unavailable = |reason: String| StorageError::Unavailable {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    unavailable(format!(
                        "failed to create database directory '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| unavailable(e.to_string()))?;
        configure_connection(&conn, options.busy_timeout, options.synchronous, false)
            .map_err(|e| unavailable(e.to_string()))?;

        // Switching journal modes needs an exclusive lock; several workers
        // starting at once contend here like any other writer.
        let mode: String = options
            .retry
            .run("enable_wal", || {
                Ok(conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?)
            })
            .map_err(|e| unavailable(e.to_string()))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(unavailable(format!(
                "journal mode is '{mode}', expected 'wal'"
            )));
        }
        drop(conn);

        let pools =
            ConnectionPools::new(path, options).map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(
            path = %path.display(),
            busy_timeout = ?options.busy_timeout,
            max_retries = options.retry.max_retries,
            "Database opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            pools,
            retry: options.retry.clone(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retry policy applied to contended transactions.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `f` inside one write transaction.
    ///
    /// The write lock is taken at `BEGIN IMMEDIATE`. On lock contention the
    /// transaction is rolled back and `f` runs again from scratch, so `f` must
    /// not have side effects outside the transaction. Once the retry ceiling
    /// is reached the error surfaces as [`StorageError::Busy`]. Any other
    /// error rolls back and is returned unchanged.
    pub fn transact<T, F>(&self, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, StorageError>,
    {
        self.retry.run("transact", || {
            let mut conn = self.pools.writer()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run `f` inside one read-only snapshot.
    ///
    /// The snapshot is pinned right after `BEGIN`, so `f` never observes
    /// commits that land while it runs. Readers do not take the write lock
    /// and do not block writers.
    pub fn query<T, F>(&self, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, StorageError>,
    {
        self.retry.run("query", || {
            let mut conn = self.pools.reader()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            tx.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })?;
            let value = f(&tx)?;
            tx.rollback()?;
            Ok(value)
        })
    }

    /// Copy WAL frames back into the database file.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointStats, StorageError> {
        let conn = self.pools.writer()?;
        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_ref());
        let (busy, wal_frames, checkpointed): (i64, i64, i64) =
            conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;

        let stats = CheckpointStats {
            busy: busy != 0,
            wal_frames,
            checkpointed,
        };
        tracing::debug!(
            mode = mode.as_ref(),
            busy = stats.busy,
            wal_frames,
            checkpointed,
            "WAL checkpoint completed"
        );
        Ok(stats)
    }

    /// Flush the WAL into the main file and release the pools.
    pub fn close(self) -> Result<(), StorageError> {
        let stats = self.checkpoint(CheckpointMode::Truncate)?;
        if stats.busy {
            tracing::debug!("Final checkpoint deferred, other connections still active");
        }
        tracing::info!(path = %self.path.display(), "Database closed");
        Ok(())
    }
}
