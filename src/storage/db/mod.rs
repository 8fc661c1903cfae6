//! Storage engine over a single SQLite file shared by many processes.
//!
//! # Architecture
//!
//! Each process opens the same file through its own [`SqliteStore`]. Nothing
//! is shared in memory; SQLite's file locks are the only synchronization:
//! - WAL journal mode so readers never wait on the single writer
//! - `busy_timeout` bounds the wait for the write lock
//! - [`SqliteStore::transact`] takes the write lock up front
//!   (`BEGIN IMMEDIATE`) and re-runs the whole closure on contention
//! - [`SqliteStore::query`] runs in a deferred read snapshot on
//!   `query_only` connections
//!
//! # Example
//!
//! ```no_run
//! use footfall::storage::{SqliteStore, StoreOptions};
//!
//! let store = SqliteStore::open("data/visitor_tracking.db", &StoreOptions::default())?;
//! let visitors: i64 = store.query(|tx| {
//!     Ok(tx.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?)
//! })?;
//! # Ok::<(), footfall::storage::StorageError>(())
//! ```

mod sqlite;

pub use sqlite::{CheckpointMode, CheckpointStats, SqliteStore, StoreOptions, SynchronousMode};
