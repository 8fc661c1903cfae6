//! Read-side lookups and aggregates.
//!
//! Every method runs inside one [`SqliteStore::query`] snapshot, so the
//! parts of a composite result (a page and its total, a stats block) are
//! consistent with each other.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row, Transaction, params};

use crate::storage::StorageError;
use crate::storage::db::SqliteStore;
use crate::storage::types::{
    Attributes, Page, Session, SortOrder, TrackedEvent, TrafficStats, Visitor, VisitorProfile,
    from_millis, to_millis,
};

/// Default number of events in a history lookup.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Default upper bound for history lookups.
pub const DEFAULT_MAX_HISTORY_LIMIT: u32 = 1000;

/// Upper bound for paged listings.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Default page size for paged listings.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Number of recent events in [`TrafficStats`].
pub const DEFAULT_STATS_LATEST: u32 = 10;

const EVENT_COLUMNS: &str = "e.id, e.session_id, e.visitor_id, v.token, e.event_type, e.ts, \
                             e.received_at, e.attributes, e.dedup_key";

/// Filter shared by event counts and listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub visitor_token: Option<String>,
    pub event_type: Option<String>,
    /// Substring of `attributes.page_url`.
    pub page_url: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Append `WHERE` clauses for this filter. Column aliases: `e` events, `v` visitors.
    fn push_where(&self, sql: &mut String, params: &mut Vec<Box<dyn ToSql>>) {
        let mut clauses: Vec<&str> = Vec::new();

        if let Some(token) = &self.visitor_token {
            clauses.push("v.token = ?");
            params.push(Box::new(token.clone()));
        }
        if let Some(event_type) = &self.event_type {
            clauses.push("e.event_type = ?");
            params.push(Box::new(event_type.clone()));
        }
        if let Some(page_url) = &self.page_url {
            clauses.push("json_extract(e.attributes, '$.page_url') LIKE ? ESCAPE '\\'");
            params.push(Box::new(format!("%{}%", escape_like(page_url))));
        }
        if let Some(since) = self.since {
            clauses.push("e.ts >= ?");
            params.push(Box::new(to_millis(since)));
        }
        if let Some(until) = self.until {
            clauses.push("e.ts <= ?");
            params.push(Box::new(to_millis(until)));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
    }
}

/// Event reader.
#[derive(Clone)]
pub struct EventReader {
    store: SqliteStore,
    max_history_limit: u32,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader").finish_non_exhaustive()
    }
}

impl EventReader {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
        }
    }

    pub fn with_max_history_limit(mut self, limit: u32) -> Self {
        self.max_history_limit = limit.max(1);
        self
    }

    /// Most recent events of one visitor, newest first.
    ///
    /// `limit` is clamped to `1..=max_history_limit`. Unknown visitors yield
    /// an empty list.
    pub fn visitor_history(
        &self,
        token: &str,
        limit: u32,
    ) -> Result<Vec<TrackedEvent>, StorageError> {
        let limit = limit.clamp(1, self.max_history_limit);
        self.store.query(|tx| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN visitors v ON v.id = e.visitor_id
                 WHERE v.token = ?1 ORDER BY e.ts DESC, e.id DESC LIMIT ?2"
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![token, limit], event_from_row)?;
            collect(rows)
        })
    }

    /// Number of events matching `filter`.
    pub fn count_events(&self, filter: &EventFilter) -> Result<u64, StorageError> {
        self.store.query(|tx| count_matching(tx, filter))
    }

    /// Look up a visitor by token.
    pub fn visitor(&self, token: &str) -> Result<Option<Visitor>, StorageError> {
        self.store.query(|tx| visitor_by_token(tx, token))
    }

    /// Sessions of one visitor, newest first.
    pub fn sessions(&self, token: &str, limit: u32) -> Result<Vec<Session>, StorageError> {
        let limit = limit.clamp(1, self.max_history_limit);
        self.store.query(|tx| sessions_by_token(tx, token, limit))
    }

    /// A visitor and its newest sessions, read from one snapshot.
    pub fn profile(
        &self,
        token: &str,
        session_limit: u32,
    ) -> Result<Option<VisitorProfile>, StorageError> {
        let limit = session_limit.clamp(1, self.max_history_limit);
        self.store.query(|tx| {
            let Some(visitor) = visitor_by_token(tx, token)? else {
                return Ok(None);
            };
            let sessions = sessions_by_token(tx, token, limit)?;
            Ok(Some(VisitorProfile { visitor, sessions }))
        })
    }

    /// Events of one session in order (timestamp, then id).
    pub fn session_events(&self, session_id: i64) -> Result<Vec<TrackedEvent>, StorageError> {
        self.store.query(|tx| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN visitors v ON v.id = e.visitor_id
                 WHERE e.session_id = ?1 ORDER BY e.ts ASC, e.id ASC"
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![session_id], event_from_row)?;
            collect(rows)
        })
    }

    /// Page through events matching `filter`, ordered by arrival.
    ///
    /// `page` is 1-based; `limit` is capped at [`MAX_PAGE_LIMIT`].
    pub fn recent_events(
        &self,
        filter: &EventFilter,
        page: u32,
        limit: u32,
        order: SortOrder,
    ) -> Result<Page<TrackedEvent>, StorageError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = i64::from(page - 1) * i64::from(limit);

        self.store.query(|tx| {
            let total = count_matching(tx, filter)?;

            let mut sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN visitors v ON v.id = e.visitor_id"
            );
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            filter.push_where(&mut sql, &mut params);
            sql.push_str(&format!(" ORDER BY e.id {} LIMIT ? OFFSET ?", order.as_sql()));
            params.push(Box::new(limit));
            params.push(Box::new(offset));

            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(refs.as_slice(), event_from_row)?;
            Ok(Page::new(collect(rows)?, page, limit, total))
        })
    }

    /// Aggregate counters plus the `latest` most recent events.
    pub fn stats(&self, latest: u32) -> Result<TrafficStats, StorageError> {
        let latest = latest.min(MAX_PAGE_LIMIT);
        self.store.query(|tx| {
            let count = |sql: &str| -> Result<u64, StorageError> {
                let n: i64 = tx.query_row(sql, [], |row| row.get(0))?;
                Ok(u64::try_from(n).unwrap_or(0))
            };

            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e JOIN visitors v ON v.id = e.visitor_id
                 ORDER BY e.id DESC LIMIT ?1"
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let latest_events = collect(stmt.query_map(params![latest], event_from_row)?)?;

            Ok(TrafficStats {
                total_events: count("SELECT COUNT(*) FROM events")?,
                total_visitors: count("SELECT COUNT(*) FROM visitors")?,
                total_sessions: count("SELECT COUNT(*) FROM sessions")?,
                open_sessions: count("SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL")?,
                active_subscribers: count("SELECT COUNT(*) FROM subscribers WHERE active = 1")?,
                latest_events,
            })
        })
    }

    /// Run a trivial read to prove the file is usable.
    pub fn ping(&self) -> Result<(), StorageError> {
        self.store
            .query(|tx| Ok(tx.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .map(|_| ())
    }
}

fn count_matching(tx: &Transaction<'_>, filter: &EventFilter) -> Result<u64, StorageError> {
    let mut sql =
        String::from("SELECT COUNT(*) FROM events e JOIN visitors v ON v.id = e.visitor_id");
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();
    filter.push_where(&mut sql, &mut params);

    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let n: i64 = tx.query_row(&sql, refs.as_slice(), |row| row.get(0))?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn collect<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StorageError> {
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(StorageError::from)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedEvent> {
    let raw_attributes: String = row.get(7)?;
    Ok(TrackedEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        visitor_id: row.get(2)?,
        visitor_token: row.get(3)?,
        event_type: row.get(4)?,
        ts: from_millis(row.get(5)?),
        received_at: from_millis(row.get(6)?),
        attributes: parse_attributes(&raw_attributes),
        dedup_key: row.get(8)?,
    })
}

fn visitor_by_token(tx: &Transaction<'_>, token: &str) -> Result<Option<Visitor>, StorageError> {
    Ok(tx
        .query_row(
            "SELECT id, token, first_seen, last_seen FROM visitors WHERE token = ?1",
            params![token],
            |row| {
                Ok(Visitor {
                    id: row.get(0)?,
                    token: row.get(1)?,
                    first_seen: from_millis(row.get(2)?),
                    last_seen: from_millis(row.get(3)?),
                })
            },
        )
        .optional()?)
}

fn sessions_by_token(
    tx: &Transaction<'_>,
    token: &str,
    limit: u32,
) -> Result<Vec<Session>, StorageError> {
    let mut stmt = tx.prepare_cached(
        "SELECT s.id, s.visitor_id, s.started_at, s.last_event_at, s.expires_at,
                s.ended_at, s.event_count
         FROM sessions s JOIN visitors v ON v.id = s.visitor_id
         WHERE v.token = ?1
         ORDER BY s.started_at DESC, s.id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![token, limit], session_from_row)?;
    collect(rows)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        visitor_id: row.get(1)?,
        started_at: from_millis(row.get(2)?),
        last_event_at: from_millis(row.get(3)?),
        expires_at: from_millis(row.get(4)?),
        ended_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        event_count: row.get(6)?,
    })
}

/// Parse stored attributes. Rows are written by the ingestor, so a parse
/// failure means outside tampering; surface an empty object instead of failing the read.
fn parse_attributes(s: &str) -> Attributes {
    serde_json::from_str(s).unwrap_or_else(|e| {
        tracing::debug!(error = %e, raw = s, "Failed to parse stored attributes, returning empty");
        Attributes::new()
    })
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::StoreOptions;
    use crate::storage::ingest::{EventIngestor, IngestPolicy};
    use crate::storage::schema::ensure_schema;
    use crate::storage::types::RawEvent;
    use chrono::TimeZone;
    use tempfile::{TempDir, tempdir};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn setup() -> (TempDir, SqliteStore, EventIngestor, EventReader) {
        let dir = tempdir().unwrap();
        let store =
            SqliteStore::open(dir.path().join("query.db"), &StoreOptions::default()).unwrap();
        ensure_schema(&store).unwrap();
        let ingestor = EventIngestor::new(store.clone(), IngestPolicy::default());
        let reader = EventReader::new(store.clone());
        (dir, store, ingestor, reader)
    }

    fn seed(ingestor: &EventIngestor) {
        let now = at(3600);
        let events = [
            ("alice", "page_view", 0, "https://example.com/"),
            ("alice", "click", 10, "https://example.com/pricing"),
            ("alice", "page_view", 20, "https://example.com/pricing"),
            ("bob", "page_view", 5, "https://example.com/blog/100%_real"),
            ("bob", "signup", 30, "https://example.com/signup"),
        ];
        for (token, event_type, secs, url) in events {
            ingestor
                .ingest_at(&RawEvent::new(token, event_type, at(secs)).with_page_url(url), now)
                .unwrap();
        }
    }

    #[test]
    fn test_visitor_history_newest_first() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        let history = reader.visitor_history("alice", 10).unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["page_view", "click", "page_view"]);
        assert_eq!(history[0].ts, at(20));
        assert_eq!(history[0].visitor_token, "alice");
        assert_eq!(
            history[0].attributes["page_url"],
            serde_json::json!("https://example.com/pricing")
        );

        assert_eq!(reader.visitor_history("alice", 0).unwrap().len(), 1);
        assert!(reader.visitor_history("nobody", 10).unwrap().is_empty());
    }

    #[test]
    fn test_count_events_filters() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        assert_eq!(reader.count_events(&EventFilter::default()).unwrap(), 5);

        let page_views = EventFilter {
            event_type: Some("page_view".into()),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&page_views).unwrap(), 3);

        let bob = EventFilter {
            visitor_token: Some("bob".into()),
            since: Some(at(10)),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&bob).unwrap(), 1);

        let pricing = EventFilter {
            page_url: Some("pricing".into()),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&pricing).unwrap(), 2);

        // LIKE wildcards in the needle match literally
        let literal = EventFilter {
            page_url: Some("100%_".into()),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&literal).unwrap(), 1);
        let wildcard = EventFilter {
            page_url: Some("%".into()),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&wildcard).unwrap(), 1);

        let window = EventFilter {
            since: Some(at(5)),
            until: Some(at(20)),
            ..Default::default()
        };
        assert_eq!(reader.count_events(&window).unwrap(), 3);
    }

    #[test]
    fn test_visitor_and_sessions() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        let alice = reader.visitor("alice").unwrap().unwrap();
        assert_eq!(alice.first_seen, at(0));
        assert_eq!(alice.last_seen, at(20));
        assert!(reader.visitor("nobody").unwrap().is_none());

        let sessions = reader.sessions("alice", 10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_open());
        assert_eq!(sessions[0].event_count, 3);

        let events = reader.session_events(sessions[0].id).unwrap();
        let ts: Vec<_> = events.iter().map(|e| e.ts).collect();
        assert_eq!(ts, [at(0), at(10), at(20)]);
    }

    #[test]
    fn test_profile_reads_visitor_with_sessions() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        let profile = reader.profile("bob", 5).unwrap().unwrap();
        assert_eq!(profile.visitor.token, "bob");
        assert_eq!(profile.sessions.len(), 1);
        assert_eq!(profile.sessions[0].visitor_id, profile.visitor.id);
        assert_eq!(profile.sessions[0].event_count, 2);

        assert!(reader.profile("nobody", 5).unwrap().is_none());
    }

    #[test]
    fn test_recent_events_paging() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        let first = reader
            .recent_events(&EventFilter::default(), 1, 2, SortOrder::Desc)
            .unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].event_type, "signup");

        let last = reader
            .recent_events(&EventFilter::default(), 3, 2, SortOrder::Desc)
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].visitor_token, "alice");

        let capped = reader
            .recent_events(&EventFilter::default(), 1, 5000, SortOrder::Asc)
            .unwrap();
        assert_eq!(capped.limit, MAX_PAGE_LIMIT);
        assert_eq!(capped.items[0].event_type, "page_view");
    }

    #[test]
    fn test_stats() {
        let (_dir, _store, ingestor, reader) = setup();
        seed(&ingestor);

        let stats = reader.stats(2).unwrap();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.total_visitors, 2);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.open_sessions, 2);
        assert_eq!(stats.active_subscribers, 0);
        assert_eq!(stats.latest_events.len(), 2);
        assert_eq!(stats.latest_events[0].event_type, "signup");
    }

    #[test]
    fn test_query_started_before_commit_does_not_see_it() {
        let (_dir, store, ingestor, _reader) = setup();
        let now = at(100);
        ingestor.ingest_at(&RawEvent::new("alice", "page_view", at(0)), now).unwrap();

        let (before, after) = store
            .query(|tx| {
                let before = count_matching(tx, &EventFilter::default())?;
                ingestor
                    .ingest_at(&RawEvent::new("alice", "click", at(1)), now)
                    .unwrap();
                let after = count_matching(tx, &EventFilter::default())?;
                Ok((before, after))
            })
            .unwrap();

        assert_eq!((before, after), (1, 1));
        assert_eq!(EventReader::new(store).count_events(&EventFilter::default()).unwrap(), 2);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a%b_c\\d"), "a\\%b\\_c\\\\d");
        assert_eq!(escape_like("plain"), "plain");
    }
}
