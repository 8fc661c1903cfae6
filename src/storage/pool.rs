//! Writer and reader connection pools using r2d2.
//!
//! Both pools open the same file. Every connection gets a bounded busy wait
//! for the file lock; reader connections additionally run with
//! `query_only` so a read path can never take the write lock.

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::storage::StorageError;
use crate::storage::db::{StoreOptions, SynchronousMode};

pub(crate) type SqliteConnection = PooledConnection<SqliteConnectionManager>;

/// Connection pools for one process.
#[derive(Clone)]
pub(crate) struct ConnectionPools {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
}

impl ConnectionPools {
    /// Build both pools.
    ///
    /// Note: the file is expected to exist and be in WAL mode already.
    pub(crate) fn new(db_path: &Path, options: &StoreOptions) -> Result<Self, StorageError> {
        let writer = build_pool(
            db_path,
            options.write_pool_size,
            options.acquire_timeout,
            options.busy_timeout,
            options.synchronous,
            false,
        )?;
        let reader = build_pool(
            db_path,
            options.read_pool_size,
            options.acquire_timeout,
            options.busy_timeout,
            options.synchronous,
            true,
        )?;

        Ok(Self { writer, reader })
    }

    /// Get a connection for a write transaction.
    pub(crate) fn writer(&self) -> Result<SqliteConnection, StorageError> {
        Ok(self.writer.get()?)
    }

    /// Get a connection for a read transaction.
    pub(crate) fn reader(&self) -> Result<SqliteConnection, StorageError> {
        Ok(self.reader.get()?)
    }
}

fn build_pool(
    db_path: &Path,
    size: u32,
    acquire_timeout: Duration,
    busy_timeout: Duration,
    synchronous: SynchronousMode,
    read_only: bool,
) -> Result<Pool<SqliteConnectionManager>, StorageError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(move |conn| configure_connection(conn, busy_timeout, synchronous, read_only));

    let pool = Pool::builder()
        .max_size(size)
        .min_idle(Some(1))
        .connection_timeout(acquire_timeout)
        .build(manager)?;

    Ok(pool)
}

/// Per-connection settings. `busy_timeout` goes first so the remaining
/// pragmas already wait on a locked file instead of failing.
pub(crate) fn configure_connection(
    conn: &Connection,
    busy_timeout: Duration,
    synchronous: SynchronousMode,
    read_only: bool,
) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(&format!(
        "PRAGMA synchronous = {};
         PRAGMA foreign_keys = ON;",
        synchronous.as_ref()
    ))?;
    if read_only {
        conn.execute_batch("PRAGMA query_only = ON;")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn wal_file(path: &Path) {
        let conn = Connection::open(path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
    }

    #[test]
    fn test_pool_creation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        wal_file(&db_path);

        let pools = ConnectionPools::new(&db_path, &StoreOptions::default()).unwrap();

        let writer = pools.writer().unwrap();
        writer.execute("INSERT INTO t (x) VALUES (1)", []).unwrap();

        let reader = pools.reader().unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reader_connections_are_query_only() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("ro.db");
        wal_file(&db_path);

        let pools = ConnectionPools::new(&db_path, &StoreOptions::default()).unwrap();
        let reader = pools.reader().unwrap();

        let err = reader
            .execute("INSERT INTO t (x) VALUES (1)", [])
            .unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ReadOnly)
        );
    }

    #[test]
    fn test_connection_pragmas_applied() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("pragmas.db");
        wal_file(&db_path);

        let options = StoreOptions {
            synchronous: SynchronousMode::Full,
            ..Default::default()
        };
        let pools = ConnectionPools::new(&db_path, &options).unwrap();
        let writer = pools.writer().unwrap();

        let sync: i64 = writer
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 2);

        let fk: i64 = writer
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }
}
