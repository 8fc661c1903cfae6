//! E-mail subscriber capture.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{OptionalExtension, Row, params};

use crate::storage::StorageError;
use crate::storage::db::SqliteStore;
use crate::storage::query::MAX_PAGE_LIMIT;
use crate::storage::types::{
    NewSubscriber, Page, SubscribeOutcome, Subscriber, SubscriberQuery, from_millis, to_millis,
};

const MAX_FIELD_CHARS: usize = 1024;

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("failed to compile email regex")
    })
}

/// Subscriber CRUD. Writes go through [`SqliteStore::transact`] like every
/// other mutation.
#[derive(Clone)]
pub struct SubscriberStore {
    store: SqliteStore,
}

impl std::fmt::Debug for SubscriberStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberStore").finish_non_exhaustive()
    }
}

impl SubscriberStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Register an address, or refresh and reactivate an existing one.
    ///
    /// Non-empty optional fields overwrite stored ones; empty ones keep them.
    pub fn subscribe(&self, request: &NewSubscriber) -> Result<SubscribeOutcome, StorageError> {
        self.subscribe_at(request, Utc::now())
    }

    pub fn subscribe_at(
        &self,
        request: &NewSubscriber,
        now: DateTime<Utc>,
    ) -> Result<SubscribeOutcome, StorageError> {
        let email = normalize_email(request.email.as_deref())?;
        let name = optional_field("name", request.name.as_deref())?;
        let visitor_token = optional_field("visitor_token", request.visitor_token.as_deref())?;
        let source_page = optional_field("source_page", request.source_page.as_deref())?;
        let comments = optional_field("comments", request.comments.as_deref())?;
        let subscribed_at = to_millis(now);

        let outcome = self.store.transact(|tx| {
            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT id, active FROM subscribers WHERE email = ?1",
                    params![email],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, active)) => {
                    tx.execute(
                        "UPDATE subscribers SET
                             active = 1,
                             name = COALESCE(?1, name),
                             visitor_token = COALESCE(?2, visitor_token),
                             source_page = COALESCE(?3, source_page),
                             comments = COALESCE(?4, comments)
                         WHERE id = ?5",
                        params![name, visitor_token, source_page, comments, id],
                    )?;
                    Ok(if active {
                        SubscribeOutcome::AlreadySubscribed(id)
                    } else {
                        SubscribeOutcome::Reactivated(id)
                    })
                }
                None => {
                    tx.execute(
                        "INSERT INTO subscribers
                             (email, name, visitor_token, source_page, comments, subscribed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![email, name, visitor_token, source_page, comments, subscribed_at],
                    )?;
                    Ok(SubscribeOutcome::Created(tx.last_insert_rowid()))
                }
            }
        })?;

        tracing::info!(subscriber_id = outcome.id(), outcome = ?outcome, "Subscription recorded");
        Ok(outcome)
    }

    /// Mark an address inactive. Returns `false` when it is unknown.
    pub fn unsubscribe(&self, email: &str) -> Result<bool, StorageError> {
        let email = normalize_email(Some(email))?;
        let updated: Option<i64> = self.store.transact(|tx| {
            Ok(tx
                .query_row(
                    "UPDATE subscribers SET active = 0 WHERE email = ?1 RETURNING id",
                    params![email],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        if let Some(id) = updated {
            tracing::info!(subscriber_id = id, "Unsubscribed");
        }
        Ok(updated.is_some())
    }

    /// Page through subscribers, newest first.
    pub fn list(&self, query: &SubscriberQuery) -> Result<Page<Subscriber>, StorageError> {
        let page = query.page.max(1);
        let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = i64::from(page - 1) * i64::from(limit);
        let filter = if query.active_only {
            " WHERE active = 1"
        } else {
            ""
        };

        self.store.query(|tx| {
            let total: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM subscribers{filter}"),
                [],
                |row| row.get(0),
            )?;

            let mut stmt = tx.prepare_cached(&format!(
                "SELECT id, email, name, visitor_token, source_page, comments, subscribed_at, active
                 FROM subscribers{filter} ORDER BY id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let items = stmt
                .query_map(params![limit, offset], subscriber_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Page::new(
                items,
                page,
                limit,
                u64::try_from(total).unwrap_or(0),
            ))
        })
    }
}

fn subscriber_from_row(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        visitor_token: row.get(3)?,
        source_page: row.get(4)?,
        comments: row.get(5)?,
        subscribed_at: from_millis(row.get(6)?),
        active: row.get(7)?,
    })
}

fn normalize_email(email: Option<&str>) -> Result<String, StorageError> {
    let email = email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| StorageError::invalid("email is required"))?;
    if email.len() > 254 || !email_regex().is_match(&email) {
        return Err(StorageError::invalid(format!("invalid email format: '{email}'")));
    }
    Ok(email)
}

fn optional_field(name: &str, value: Option<&str>) -> Result<Option<String>, StorageError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if v.chars().count() > MAX_FIELD_CHARS => Err(StorageError::invalid(format!(
            "{name} longer than {MAX_FIELD_CHARS} characters"
        ))),
        Some(v) => Ok(Some(v.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ErrorClass;
    use crate::storage::db::StoreOptions;
    use crate::storage::schema::ensure_schema;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, SubscriberStore) {
        let dir = tempdir().unwrap();
        let store =
            SqliteStore::open(dir.path().join("subs.db"), &StoreOptions::default()).unwrap();
        ensure_schema(&store).unwrap();
        (dir, SubscriberStore::new(store))
    }

    #[test]
    fn test_subscribe_lifecycle() {
        let (_dir, subs) = setup();

        let created = subs
            .subscribe(&NewSubscriber {
                name: Some("Ada".into()),
                source_page: Some("/launch".into()),
                ..NewSubscriber::new("  Ada@Example.COM ")
            })
            .unwrap();
        assert!(matches!(created, SubscribeOutcome::Created(_)));

        let again = subs.subscribe(&NewSubscriber::new("ada@example.com")).unwrap();
        assert_eq!(again, SubscribeOutcome::AlreadySubscribed(created.id()));

        assert!(subs.unsubscribe("ADA@example.com").unwrap());
        assert!(!subs.unsubscribe("nobody@example.com").unwrap());

        let back = subs
            .subscribe(&NewSubscriber {
                comments: Some("missed you".into()),
                ..NewSubscriber::new("ada@example.com")
            })
            .unwrap();
        assert_eq!(back, SubscribeOutcome::Reactivated(created.id()));

        let page = subs.list(&SubscriberQuery::default()).unwrap();
        assert_eq!(page.total, 1);
        let stored = &page.items[0];
        assert_eq!(stored.email, "ada@example.com");
        // Empty fields keep what was stored
        assert_eq!(stored.name.as_deref(), Some("Ada"));
        assert_eq!(stored.source_page.as_deref(), Some("/launch"));
        assert_eq!(stored.comments.as_deref(), Some("missed you"));
        assert!(stored.active);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_logs_carry_subscriber_id_not_address() {
        let (_dir, subs) = setup();
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        let id = tracing::subscriber::with_default(subscriber, || {
            let outcome = subs.subscribe(&NewSubscriber::new("grace@example.com")).unwrap();
            assert!(subs.unsubscribe("grace@example.com").unwrap());
            outcome.id()
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Subscription recorded"), "{output}");
        assert!(output.contains("Unsubscribed"), "{output}");
        assert!(output.contains(&format!("subscriber_id={id}")), "{output}");
        assert!(!output.contains("grace@example.com"), "{output}");
    }

    #[test]
    fn test_invalid_email_rejected() {
        let (_dir, subs) = setup();

        for email in ["", "   ", "no-at-sign", "a@b", "a b@example.com"] {
            let err = subs.subscribe(&NewSubscriber::new(email)).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Invalid, "{email}");
        }
        let err = subs.subscribe(&NewSubscriber::default()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let (_dir, subs) = setup();
        for i in 0..5 {
            subs.subscribe(&NewSubscriber::new(format!("user{i}@example.com")))
                .unwrap();
        }
        subs.unsubscribe("user0@example.com").unwrap();

        let active = subs.list(&SubscriberQuery::default()).unwrap();
        assert_eq!(active.total, 4);
        assert_eq!(active.items[0].email, "user4@example.com");

        let all = subs
            .list(&SubscriberQuery {
                page: 2,
                limit: 2,
                active_only: false,
            })
            .unwrap();
        assert_eq!(all.total, 5);
        assert_eq!(all.total_pages, 3);
        let emails: Vec<_> = all.items.iter().map(|s| s.email.as_str()).collect();
        assert_eq!(emails, ["user2@example.com", "user1@example.com"]);

        let capped = subs
            .list(&SubscriberQuery {
                limit: 1000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(capped.limit, MAX_PAGE_LIMIT);
    }
}
