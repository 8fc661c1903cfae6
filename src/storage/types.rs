//! Core data types for the storage layer.
//!
//! - [`Visitor`], [`Session`], [`TrackedEvent`]: the tracking entities
//! - [`RawEvent`] / [`IngestReceipt`]: ingestion input and result
//! - [`Subscriber`], [`NewSubscriber`], [`SubscribeOutcome`]: e-mail capture
//! - [`Page`], [`TrafficStats`]: read-side result shapes
//!
//! Timestamps are persisted as Unix epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Free-form JSON attributes attached to an event.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A unique client identity tracked across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    /// Row identifier.
    pub id: i64,
    /// Opaque token supplied by the client.
    pub token: String,
    /// Earliest event timestamp committed for this visitor.
    pub first_seen: DateTime<Utc>,
    /// Latest event timestamp committed for this visitor.
    pub last_seen: DateTime<Utc>,
}

/// A bounded run of events from one visitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub visitor_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    /// Wall-clock instant after which the background sweep may close it.
    pub expires_at: DateTime<Utc>,
    /// `None` while the session is open.
    pub ended_at: Option<DateTime<Utc>>,
    pub event_count: i64,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A visitor together with its newest sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorProfile {
    pub visitor: Visitor,
    pub sessions: Vec<Session>,
}

/// A stored, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: i64,
    pub session_id: i64,
    pub visitor_id: i64,
    pub visitor_token: String,
    pub event_type: String,
    /// Client-reported time of the event.
    pub ts: DateTime<Utc>,
    /// Server time the event was accepted.
    pub received_at: DateTime<Utc>,
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

/// An inbound event as received at the boundary, before validation.
///
/// Every field is optional so that missing fields surface as validation
/// errors instead of decode errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, alias = "visitor_id")]
    pub visitor_token: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Attributes,
    /// Folded into `attributes["page_url"]`.
    #[serde(default)]
    pub page_url: Option<String>,
    /// Folded into `attributes["referrer"]`.
    #[serde(default)]
    pub referrer: Option<String>,
    /// Client-generated idempotency key.
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl RawEvent {
    /// Convenience constructor used by callers and tests.
    pub fn new(
        visitor_token: impl Into<String>,
        event_type: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            visitor_token: Some(visitor_token.into()),
            event_type: Some(event_type.into()),
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Result of a successful ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub event_id: i64,
    pub session_id: i64,
    pub visitor_id: i64,
    pub is_new_visitor: bool,
    pub new_session: bool,
    /// The dedup key matched an already-stored event; nothing was written.
    pub duplicate: bool,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, page: u32, limit: u32, total: u64) -> Self {
        let total_pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit))
        };
        Self {
            items,
            page,
            limit,
            total,
            total_pages,
        }
    }
}

/// Aggregate counters plus the most recent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub total_events: u64,
    pub total_visitors: u64,
    pub total_sessions: u64,
    pub open_sessions: u64,
    pub active_subscribers: u64,
    pub latest_events: Vec<TrackedEvent>,
}

/// Sort order for listings.
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
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A stored e-mail subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub visitor_token: Option<String>,
    pub source_page: Option<String>,
    pub comments: Option<String>,
    pub subscribed_at: DateTime<Utc>,
    pub active: bool,
}

/// Subscription request as received at the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSubscriber {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "visitor_id")]
    pub visitor_token: Option<String>,
    #[serde(default)]
    pub source_page: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl NewSubscriber {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Default::default()
        }
    }
}

/// What `subscribe` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "id", rename_all = "snake_case")]
pub enum SubscribeOutcome {
    Created(i64),
    Reactivated(i64),
    AlreadySubscribed(i64),
}

impl SubscribeOutcome {
    pub fn id(&self) -> i64 {
        match *self {
            Self::Created(id) | Self::Reactivated(id) | Self::AlreadySubscribed(id) => id,
        }
    }
}

/// Listing parameters for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberQuery {
    pub page: u32,
    pub limit: u32,
    pub active_only: bool,
}

impl Default for SubscriberQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            active_only: true,
        }
    }
}

/// Epoch milliseconds for a timestamp.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Timestamp for stored epoch milliseconds. Out-of-range values clamp to the epoch.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
