//! Database schema definitions and versioning.
//!
//! The schema version lives in `PRAGMA user_version`. Creation runs as an
//! ordinary write transaction, so any number of processes may race through
//! startup: the first to take the write lock creates everything, the rest
//! observe the version and return.

use crate::storage::StorageError;
use crate::storage::db::SqliteStore;

/// Version written by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// SQL statement for creating the visitors table.
pub const VISITORS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS visitors (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    token      TEXT NOT NULL UNIQUE,
    first_seen INTEGER NOT NULL,
    last_seen  INTEGER NOT NULL
);
"#;

/// SQL statement for creating the sessions table.
///
/// The partial unique index guarantees at most one open session per visitor
/// even if a buggy writer bypassed the ingest path.
pub const SESSIONS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    visitor_id    INTEGER NOT NULL REFERENCES visitors(id),
    started_at    INTEGER NOT NULL,
    last_event_at INTEGER NOT NULL,
    expires_at    INTEGER NOT NULL,
    ended_at      INTEGER,
    event_count   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_visitor_started ON sessions(visitor_id, started_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_open
    ON sessions(visitor_id) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_open_expiry ON sessions(expires_at) WHERE ended_at IS NULL;
"#;

/// SQL statement for creating the events table.
///
/// Events are immutable: triggers abort every UPDATE and DELETE.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  INTEGER NOT NULL REFERENCES sessions(id),
    visitor_id  INTEGER NOT NULL REFERENCES visitors(id),
    event_type  TEXT NOT NULL,
    ts          INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    attributes  TEXT NOT NULL DEFAULT '{}',
    dedup_key   TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, ts, id);
CREATE INDEX IF NOT EXISTS idx_events_visitor_ts ON events(visitor_id, ts, id);
CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events(event_type, ts);
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_dedup ON events(dedup_key) WHERE dedup_key IS NOT NULL;
CREATE TRIGGER IF NOT EXISTS events_immutable
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are immutable');
END;
CREATE TRIGGER IF NOT EXISTS events_undeletable
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are immutable');
END;
"#;

/// SQL statement for creating the subscribers table.
pub const SUBSCRIBERS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS subscribers (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    email         TEXT NOT NULL UNIQUE,
    name          TEXT,
    visitor_token TEXT,
    source_page   TEXT,
    comments      TEXT,
    subscribed_at INTEGER NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1
);
"#;

/// Create the schema if the file is new, verify it otherwise.
///
/// Fails with [`StorageError::SchemaMismatch`] when the file was written by a
/// newer build.
pub fn ensure_schema(store: &SqliteStore) -> Result<(), StorageError> {
    let created = store.transact(|tx| {
        let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                tx.execute_batch(VISITORS_TABLE_DDL)?;
                tx.execute_batch(SESSIONS_TABLE_DDL)?;
                tx.execute_batch(EVENTS_TABLE_DDL)?;
                tx.execute_batch(SUBSCRIBERS_TABLE_DDL)?;
                tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
                Ok(true)
            }
            SCHEMA_VERSION => Ok(false),
            found => Err(StorageError::SchemaMismatch {
                found,
                supported: SCHEMA_VERSION,
            }),
        }
    })?;

    if created {
        tracing::info!(version = SCHEMA_VERSION, "Database schema initialized");
    } else {
        tracing::debug!(version = SCHEMA_VERSION, "Database schema up to date");
    }
    Ok(())
}
