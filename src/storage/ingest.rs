//! Event ingestion: validation, identity resolution and the single write
//! transaction per event.
//!
//! Every accepted event costs exactly one [`SqliteStore::transact`] call that
//! upserts the visitor, resolves or rolls over the open session, and inserts
//! the event. Either all of it commits or none of it does.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::StorageError;
use crate::storage::db::SqliteStore;
use crate::storage::types::{Attributes, IngestReceipt, RawEvent, to_millis};

/// Default gap after which the next event starts a new session.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default cap on serialized attribute size.
pub const DEFAULT_MAX_ATTRIBUTES_BYTES: usize = 8192;

/// Default oldest accepted event, relative to server time.
pub const DEFAULT_MAX_EVENT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default tolerance for client clocks running ahead.
pub const DEFAULT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);

const MAX_TOKEN_CHARS: usize = 128;
const MAX_EVENT_TYPE_CHARS: usize = 64;
const MAX_DEDUP_KEY_CHARS: usize = 128;

/// Validation and sessionization rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestPolicy {
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
    pub max_attributes_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub max_event_age: Duration,
    #[serde(with = "humantime_serde")]
    pub max_future_skew: Duration,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            session_idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            max_attributes_bytes: DEFAULT_MAX_ATTRIBUTES_BYTES,
            max_event_age: DEFAULT_MAX_EVENT_AGE,
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW,
        }
    }
}

/// A validated event ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub visitor_token: String,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub attributes: Attributes,
    pub dedup_key: Option<String>,
}

/// Ingestion service.
///
/// Cheap to clone. Holds no per-request state; every call reads the current
/// visitor and session rows inside its own transaction.
#[derive(Clone)]
pub struct EventIngestor {
    store: SqliteStore,
    policy: IngestPolicy,
}

impl std::fmt::Debug for EventIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIngestor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl EventIngestor {
    pub fn new(store: SqliteStore, policy: IngestPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &IngestPolicy {
        &self.policy
    }

    /// Validate and persist one event.
    pub fn ingest(&self, raw: &RawEvent) -> Result<IngestReceipt, StorageError> {
        self.ingest_at(raw, Utc::now())
    }

    /// Same as [`ingest`](Self::ingest) with an explicit server clock.
    pub fn ingest_at(
        &self,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestReceipt, StorageError> {
        let event = self.normalize(raw, now)?;
        let attributes = serde_json::to_string(&event.attributes)?;
        let idle_ms = duration_millis(self.policy.session_idle_timeout);
        let received_at = to_millis(now);

        let receipt = self
            .store
            .transact(|tx| write_event(tx, &event, &attributes, received_at, idle_ms))?;

        tracing::debug!(
            visitor = %event.visitor_token,
            event_type = %event.event_type,
            event_id = receipt.event_id,
            session_id = receipt.session_id,
            new_session = receipt.new_session,
            duplicate = receipt.duplicate,
            "Event ingested"
        );
        Ok(receipt)
    }

    /// Validate and normalize an inbound event without touching storage.
    pub fn normalize(
        &self,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<NormalizedEvent, StorageError> {
        let visitor_token = validate_token(raw.visitor_token.as_deref())?;
        let event_type = validate_event_type(raw.event_type.as_deref())?;
        let ts = raw
            .timestamp
            .ok_or_else(|| StorageError::invalid("missing timestamp"))?;
        self.check_clock_window(ts, now)?;

        let mut attributes = Attributes::new();
        for (key, value) in &raw.attributes {
            let key = key.trim();
            if key.is_empty() {
                return Err(StorageError::invalid("attribute keys must not be empty"));
            }
            attributes.insert(key.to_string(), trim_value(value));
        }
        for (key, value) in [("page_url", &raw.page_url), ("referrer", &raw.referrer)] {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                attributes.insert(key.to_string(), Value::String(v.to_string()));
            }
        }

        let size = serde_json::to_vec(&attributes)?.len();
        if size > self.policy.max_attributes_bytes {
            return Err(StorageError::invalid(format!(
                "attributes are {size} bytes, limit is {}",
                self.policy.max_attributes_bytes
            )));
        }

        let dedup_key = match raw.dedup_key.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(key) if key.chars().count() > MAX_DEDUP_KEY_CHARS => {
                return Err(StorageError::invalid(format!(
                    "dedup key longer than {MAX_DEDUP_KEY_CHARS} characters"
                )));
            }
            Some(key) => Some(key.to_string()),
        };

        Ok(NormalizedEvent {
            visitor_token,
            event_type,
            ts,
            attributes,
            dedup_key,
        })
    }

    /// Close every open session whose expiry is before `now`.
    pub fn close_idle_sessions(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        sweep_idle_sessions(&self.store, now)
    }

    fn check_clock_window(
        &self,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let oldest = now
            .checked_sub_signed(chrono_duration(self.policy.max_event_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let newest = now
            .checked_add_signed(chrono_duration(self.policy.max_future_skew))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if ts < oldest {
            return Err(StorageError::invalid(format!(
                "timestamp {ts} is older than the accepted window"
            )));
        }
        if ts > newest {
            return Err(StorageError::invalid(format!(
                "timestamp {ts} is too far in the future"
            )));
        }
        Ok(())
    }
}

/// Close open sessions past their expiry. Sessions end at their last event.
pub fn sweep_idle_sessions(
    store: &SqliteStore,
    now: DateTime<Utc>,
) -> Result<usize, StorageError> {
    let now_ms = to_millis(now);
    let closed = store.transact(|tx| {
        Ok(tx.execute(
            "UPDATE sessions SET ended_at = last_event_at
             WHERE ended_at IS NULL AND expires_at < ?1",
            params![now_ms],
        )?)
    })?;

    if closed > 0 {
        tracing::debug!(closed, "Closed idle sessions");
    }
    Ok(closed)
}

/// Where an event lands relative to the visitor's open session.
#[derive(Debug, Clone, Copy)]
enum SessionPlacement {
    /// No open session yet.
    Open,
    /// Within the idle timeout of the open session.
    Extend(i64),
    /// Past the idle timeout after the open session; close it and start anew.
    RollOver(i64),
    /// Older than the open session by more than the idle timeout.
    Detached,
}

/// The write transaction body. Re-run from scratch on lock contention.
fn write_event(
    tx: &Transaction<'_>,
    event: &NormalizedEvent,
    attributes: &str,
    received_at: i64,
    idle_ms: i64,
) -> Result<IngestReceipt, StorageError> {
    let ts = to_millis(event.ts);

    if let Some(key) = &event.dedup_key {
        let existing = tx
            .query_row(
                "SELECT id, session_id, visitor_id FROM events WHERE dedup_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((event_id, session_id, visitor_id)) = existing {
            return Ok(IngestReceipt {
                event_id,
                session_id,
                visitor_id,
                is_new_visitor: false,
                new_session: false,
                duplicate: true,
            });
        }
    }

    // Visitor: first/last seen converge regardless of commit order
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM visitors WHERE token = ?1",
            params![event.visitor_token],
            |row| row.get(0),
        )
        .optional()?;
    let (visitor_id, is_new_visitor) = match existing {
        Some(id) => {
            tx.prepare_cached(
                "UPDATE visitors SET
                     first_seen = MIN(first_seen, ?1),
                     last_seen = MAX(last_seen, ?1)
                 WHERE id = ?2",
            )?
            .execute(params![ts, id])?;
            (id, false)
        }
        None => {
            tx.prepare_cached(
                "INSERT INTO visitors (token, first_seen, last_seen) VALUES (?1, ?2, ?2)",
            )?
            .execute(params![event.visitor_token, ts])?;
            (tx.last_insert_rowid(), true)
        }
    };

    // Session: extend the open one while the event falls within the idle
    // timeout of either end, roll over on a forward gap, and file much older
    // events in a closed session of their own.
    let open: Option<(i64, i64, i64)> = tx
        .query_row(
            "SELECT id, started_at, last_event_at FROM sessions
             WHERE visitor_id = ?1 AND ended_at IS NULL",
            params![visitor_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let placement = match open {
        Some((id, started_at, last_event_at)) => {
            if ts.saturating_sub(last_event_at) > idle_ms {
                SessionPlacement::RollOver(id)
            } else if ts < started_at.saturating_sub(idle_ms) {
                SessionPlacement::Detached
            } else {
                SessionPlacement::Extend(id)
            }
        }
        None => SessionPlacement::Open,
    };

    let expires_at = ts.saturating_add(idle_ms);
    let (session_id, new_session) = match placement {
        SessionPlacement::Extend(id) => {
            // Right-hand sides read the pre-update row
            tx.prepare_cached(
                "UPDATE sessions SET
                     started_at = MIN(started_at, ?1),
                     last_event_at = MAX(last_event_at, ?1),
                     expires_at = MAX(expires_at, ?2),
                     event_count = event_count + 1
                 WHERE id = ?3",
            )?
            .execute(params![ts, expires_at, id])?;
            (id, false)
        }
        SessionPlacement::Detached => {
            tx.prepare_cached(
                "INSERT INTO sessions
                     (visitor_id, started_at, last_event_at, expires_at, ended_at, event_count)
                 VALUES (?1, ?2, ?2, ?3, ?2, 1)",
            )?
            .execute(params![visitor_id, ts, expires_at])?;
            (tx.last_insert_rowid(), true)
        }
        SessionPlacement::RollOver(_) | SessionPlacement::Open => {
            if let SessionPlacement::RollOver(id) = placement {
                tx.prepare_cached("UPDATE sessions SET ended_at = last_event_at WHERE id = ?1")?
                    .execute(params![id])?;
            }
            tx.prepare_cached(
                "INSERT INTO sessions
                     (visitor_id, started_at, last_event_at, expires_at, event_count)
                 VALUES (?1, ?2, ?2, ?3, 1)",
            )?
            .execute(params![visitor_id, ts, expires_at])?;
            (tx.last_insert_rowid(), true)
        }
    };

    tx.prepare_cached(
        "INSERT INTO events
             (session_id, visitor_id, event_type, ts, received_at, attributes, dedup_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        session_id,
        visitor_id,
        event.event_type,
        ts,
        received_at,
        attributes,
        event.dedup_key,
    ])?;

    Ok(IngestReceipt {
        event_id: tx.last_insert_rowid(),
        session_id,
        visitor_id,
        is_new_visitor,
        new_session,
        duplicate: false,
    })
}

fn validate_token(token: Option<&str>) -> Result<String, StorageError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StorageError::invalid("missing visitor token"))?;
    if token.chars().count() > MAX_TOKEN_CHARS {
        return Err(StorageError::invalid(format!(
            "visitor token longer than {MAX_TOKEN_CHARS} characters"
        )));
    }
    if token.chars().any(char::is_control) {
        return Err(StorageError::invalid(
            "visitor token contains control characters",
        ));
    }
    Ok(token.to_string())
}

fn validate_event_type(event_type: Option<&str>) -> Result<String, StorageError> {
    let event_type = event_type
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StorageError::invalid("missing event type"))?;
    if event_type.chars().count() > MAX_EVENT_TYPE_CHARS {
        return Err(StorageError::invalid(format!(
            "event type longer than {MAX_EVENT_TYPE_CHARS} characters"
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-');
    if !event_type.chars().all(allowed) {
        return Err(StorageError::invalid(format!(
            "event type '{event_type}' contains unsupported characters"
        )));
    }
    Ok(event_type.to_string())
}

fn trim_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErrorClass;
    use crate::storage::db::StoreOptions;
    use crate::storage::retry::RetryPolicy;
    use crate::storage::schema::ensure_schema;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + chrono::Duration::seconds(secs)
    }

    fn open(path: &Path, options: &StoreOptions) -> SqliteStore {
        let store = SqliteStore::open(path, options).unwrap();
        ensure_schema(&store).unwrap();
        store
    }

    fn setup(idle: Duration) -> (TempDir, SqliteStore, EventIngestor) {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("ingest.db"), &StoreOptions::default());
        let policy = IngestPolicy {
            session_idle_timeout: idle,
            ..Default::default()
        };
        let ingestor = EventIngestor::new(store.clone(), policy);
        (dir, store, ingestor)
    }

    fn scalar(store: &SqliteStore, sql: &str) -> i64 {
        store
            .query(|tx| Ok(tx.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }

    fn sessions(store: &SqliteStore) -> Vec<(i64, i64, Option<i64>, i64)> {
        store
            .query(|tx| {
                let mut stmt = tx.prepare(
                    "SELECT id, started_at, ended_at, event_count FROM sessions ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .unwrap()
    }

    #[test]
    fn test_idle_rollover_scenario() {
        let (_dir, store, ingestor) = setup(Duration::from_secs(100));
        let now = at(2000);

        let e1 = ingestor.ingest_at(&RawEvent::new("A", "page_view", at(0)), now).unwrap();
        let e2 = ingestor.ingest_at(&RawEvent::new("A", "click", at(5)), now).unwrap();

        assert!(e1.is_new_visitor && e1.new_session);
        assert!(!e2.is_new_visitor && !e2.new_session);
        assert_eq!(e1.session_id, e2.session_id);

        let rows = sessions(&store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, None);
        assert_eq!(rows[0].3, 2);

        let e3 = ingestor.ingest_at(&RawEvent::new("A", "page_view", at(1000)), now).unwrap();
        assert!(e3.new_session);
        assert_ne!(e3.session_id, e1.session_id);

        let rows = sessions(&store);
        assert_eq!(rows.len(), 2);
        // Session 1 ends at its last event (t=5)
        assert_eq!(rows[0].2, Some(to_millis(at(5))));
        assert_eq!(rows[1].2, None);
        assert_eq!(rows[1].3, 1);

        let in_second = scalar(
            &store,
            &format!("SELECT COUNT(*) FROM events WHERE session_id = {}", e3.session_id),
        );
        assert_eq!(in_second, 1);
    }

    #[test]
    fn test_visitor_seen_bounds_are_monotonic() {
        let (_dir, store, ingestor) = setup(Duration::from_secs(3600));
        let now = at(100);

        ingestor.ingest_at(&RawEvent::new("A", "page_view", at(10)), now).unwrap();
        ingestor.ingest_at(&RawEvent::new("A", "page_view", at(3)), now).unwrap();
        ingestor.ingest_at(&RawEvent::new("A", "page_view", at(7)), now).unwrap();

        assert_eq!(scalar(&store, "SELECT last_seen FROM visitors"), to_millis(at(10)));
        assert_eq!(scalar(&store, "SELECT first_seen FROM visitors"), to_millis(at(3)));

        // Late events join the open session and widen its bounds
        let rows = sessions(&store);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, to_millis(at(3)));
        assert_eq!(
            scalar(&store, "SELECT expires_at FROM sessions"),
            to_millis(at(10)) + 3_600_000
        );
    }

    #[test]
    fn test_event_far_behind_open_session_gets_closed_session() {
        let idle = Duration::from_secs(30 * 60);
        let (_dir, store, ingestor) = setup(idle);
        let now = at(10 * 24 * 3600);

        let current = ingestor.ingest_at(&RawEvent::new("A", "page_view", now), now).unwrap();
        let six_days_ago = now - chrono::Duration::days(6);
        let late = ingestor
            .ingest_at(&RawEvent::new("A", "page_view", six_days_ago), now)
            .unwrap();

        assert!(late.new_session);
        assert_ne!(late.session_id, current.session_id);

        let rows = sessions(&store);
        assert_eq!(rows.len(), 2);
        // Open session keeps its bounds and count
        assert_eq!(rows[0], (current.session_id, to_millis(now), None, 1));
        // Late event sits alone in an already-closed session
        let ts = to_millis(six_days_ago);
        assert_eq!(rows[1], (late.session_id, ts, Some(ts), 1));

        // Slightly late events still join the open session
        let near = ingestor
            .ingest_at(&RawEvent::new("A", "click", now - chrono::Duration::minutes(10)), now)
            .unwrap();
        assert_eq!(near.session_id, current.session_id);
        assert_eq!(
            scalar(&store, "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL"),
            1
        );
        assert_eq!(scalar(&store, "SELECT first_seen FROM visitors"), ts);
    }

    #[test]
    fn test_unbounded_clock_window_does_not_overflow() {
        let dir = tempdir().unwrap();
        let store = open(&dir.path().join("window.db"), &StoreOptions::default());
        let ingestor = EventIngestor::new(
            store.clone(),
            IngestPolicy {
                max_event_age: Duration::from_secs(u64::MAX),
                max_future_skew: Duration::from_secs(u64::MAX),
                ..Default::default()
            },
        );
        let now = Utc::now();

        for ts in [now - chrono::Duration::days(400), now + chrono::Duration::days(400)] {
            let receipt = ingestor.ingest_at(&RawEvent::new("A", "page_view", ts), now);
            assert!(receipt.is_ok(), "{receipt:?}");
        }
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM events"), 2);
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let (_dir, store, ingestor) = setup(DEFAULT_SESSION_IDLE_TIMEOUT);
        let now = at(0);

        let cases = [
            RawEvent {
                visitor_token: None,
                ..RawEvent::new("x", "page_view", now)
            },
            RawEvent {
                visitor_token: Some("   ".into()),
                ..RawEvent::new("x", "page_view", now)
            },
            RawEvent {
                event_type: None,
                ..RawEvent::new("x", "page_view", now)
            },
            RawEvent {
                timestamp: None,
                ..RawEvent::new("x", "page_view", now)
            },
        ];
        for raw in &cases {
            let err = ingestor.ingest_at(raw, now).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Invalid, "{raw:?}");
        }

        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM visitors"), 0);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM events"), 0);
    }

    #[test]
    fn test_field_rules() {
        let (_dir, _store, ingestor) = setup(DEFAULT_SESSION_IDLE_TIMEOUT);
        let now = at(0);
        let invalid = |raw: RawEvent| {
            ingestor
                .normalize(&raw, now)
                .is_err_and(|e| e.class() == ErrorClass::Invalid)
        };

        assert!(invalid(RawEvent::new("a".repeat(129), "page_view", now)));
        assert!(invalid(RawEvent::new("tab\there", "page_view", now)));
        assert!(invalid(RawEvent::new("A", "page view", now)));
        assert!(invalid(RawEvent::new("A", "e".repeat(65), now)));
        assert!(invalid(RawEvent::new("A", "page_view", now + chrono::Duration::hours(1))));
        assert!(invalid(RawEvent::new("A", "page_view", now - chrono::Duration::days(8))));
        assert!(invalid(RawEvent::new("A", "page_view", now).with_attribute("  ", 1)));
        assert!(invalid(
            RawEvent::new("A", "page_view", now).with_dedup_key("k".repeat(200))
        ));

        assert!(!invalid(RawEvent::new("a".repeat(128), "app:checkout.step-2", now)));
        assert!(!invalid(RawEvent::new("A", "page_view", now + chrono::Duration::minutes(4))));
    }

    #[test]
    fn test_normalization() {
        let (_dir, _store, ingestor) = setup(DEFAULT_SESSION_IDLE_TIMEOUT);
        let now = at(0);

        let raw = RawEvent::new("  visitor-1 ", " page_view ", now)
            .with_attribute(" title ", "  Home  ")
            .with_attribute("width", 1280)
            .with_page_url(" https://example.com/ ")
            .with_dedup_key("  ");
        let event = ingestor.normalize(&raw, now).unwrap();

        assert_eq!(event.visitor_token, "visitor-1");
        assert_eq!(event.event_type, "page_view");
        assert_eq!(event.attributes["title"], json!("Home"));
        assert_eq!(event.attributes["width"], json!(1280));
        assert_eq!(event.attributes["page_url"], json!("https://example.com/"));
        assert!(!event.attributes.contains_key("referrer"));
        assert_eq!(event.dedup_key, None);
    }

    #[test]
    fn test_oversized_attributes_rejected_not_truncated() {
        let (_dir, store, ingestor) = setup(DEFAULT_SESSION_IDLE_TIMEOUT);
        let now = at(0);

        let raw =
            RawEvent::new("A", "page_view", now).with_attribute("blob", "x".repeat(9000));
        let err = ingestor.ingest_at(&raw, now).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM events"), 0);
    }

    #[test]
    fn test_dedup_key_makes_retries_idempotent() {
        let (_dir, store, ingestor) = setup(DEFAULT_SESSION_IDLE_TIMEOUT);
        let now = at(0);
        let raw = RawEvent::new("A", "purchase", now).with_dedup_key("order-17");

        let first = ingestor.ingest_at(&raw, now).unwrap();
        let second = ingestor.ingest_at(&raw, now).unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.event_id, second.event_id);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM events"), 1);
        assert_eq!(scalar(&store, "SELECT event_count FROM sessions"), 1);
    }

    #[test]
    fn test_close_idle_sessions() {
        let (_dir, store, ingestor) = setup(Duration::from_secs(60));

        ingestor.ingest_at(&RawEvent::new("A", "page_view", at(0)), at(0)).unwrap();
        ingestor.ingest_at(&RawEvent::new("B", "page_view", at(50)), at(50)).unwrap();

        // A expires at t=60, B at t=110
        assert_eq!(ingestor.close_idle_sessions(at(61)).unwrap(), 1);
        assert_eq!(ingestor.close_idle_sessions(at(61)).unwrap(), 0);
        assert_eq!(
            scalar(&store, "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL"),
            1
        );

        // A's next event opens a fresh session
        let receipt = ingestor
            .ingest_at(&RawEvent::new("A", "page_view", at(62)), at(62))
            .unwrap();
        assert!(receipt.new_session);
    }

    #[test]
    fn test_concurrent_ingest_keeps_one_open_session() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("same-visitor.db");
        open(&db_path, &StoreOptions::default());
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let db_path = db_path.clone();
                std::thread::spawn(move || {
                    // Separate handle per thread, like separate worker processes
                    let store = SqliteStore::open(&db_path, &StoreOptions::default()).unwrap();
                    let ingestor = EventIngestor::new(store, IngestPolicy::default());
                    for i in 0..10 {
                        let raw = RawEvent::new("shared", "page_view", now)
                            .with_attribute("worker", worker)
                            .with_attribute("seq", i);
                        ingestor.ingest_at(&raw, now).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(&db_path, &StoreOptions::default()).unwrap();
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM events"), 80);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM visitors"), 1);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM sessions"), 1);
        assert_eq!(scalar(&store, "SELECT event_count FROM sessions"), 80);
    }

    #[test]
    fn test_contention_across_handles_stays_under_retry_ceiling() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("contention.db");
        open(&db_path, &StoreOptions::default());
        let options = StoreOptions {
            retry: RetryPolicy {
                max_retries: 5,
                ..Default::default()
            },
            write_pool_size: 1,
            read_pool_size: 1,
            ..Default::default()
        };
        let now = Utc::now();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(50));

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let db_path = db_path.clone();
                let options = options.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let store = SqliteStore::open(&db_path, &options)?;
                    let ingestor = EventIngestor::new(store, IngestPolicy::default());
                    barrier.wait();
                    let raw = RawEvent::new(format!("visitor-{i}"), "page_view", now);
                    ingestor.ingest_at(&raw, now)
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap();
            assert!(result.is_ok(), "ingest failed: {result:?}");
        }

        let store = SqliteStore::open(&db_path, &StoreOptions::default()).unwrap();
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM visitors"), 50);
        assert_eq!(scalar(&store, "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL"), 50);
    }

    #[test]
    fn test_committed_event_visible_to_fresh_handle_without_close() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("durable.db");
        let now = Utc::now();

        {
            let store = open(&db_path, &StoreOptions::default());
            let ingestor = EventIngestor::new(store.clone(), IngestPolicy::default());
            ingestor
                .ingest_at(&RawEvent::new("A", "signup", now), now)
                .unwrap();
            // No close, no checkpoint
            std::mem::forget(ingestor);
            std::mem::forget(store);
        }

        let reopened = open(&db_path, &StoreOptions::default());
        let signups = scalar(&reopened, "SELECT COUNT(*) FROM events WHERE event_type = 'signup'");
        assert_eq!(signups, 1);
    }
}
