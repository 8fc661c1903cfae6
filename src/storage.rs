//! Storage Layer
//!
//! Concurrent-safe SQLite storage shared by independent worker processes:
//! - **Engine**: WAL-mode file, writer and `query_only` reader pools, and
//!   busy-retry with exponential backoff around every transaction
//! - **Services**: ingestion, queries and subscribers, each a thin layer over
//!   `transact` / `query`
//!
//! # Components
//!
//! - [`SqliteStore`]: open, `transact`, `query`, checkpoint
//! - [`EventIngestor`]: validate and persist tracking events
//! - [`EventReader`]: visitor history, counts, listings and stats
//! - [`SubscriberStore`]: e-mail subscription capture
//! - [`StorageAdmin`]: maintenance commands
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle management

mod actor;
mod admin;
mod builder;
pub mod db;
mod error;
pub mod ingest;
mod pool;
pub mod query;
pub mod retry;
mod schema;
pub mod subscribers;
mod types;

pub use actor::{DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_SWEEP_INTERVAL};
pub use admin::StorageAdmin;
pub use builder::{StorageBuilder, StorageHandles};
pub use db::{CheckpointMode, CheckpointStats, SqliteStore, StoreOptions, SynchronousMode};
pub use error::{ErrorClass, StorageError};
pub use ingest::{EventIngestor, IngestPolicy, NormalizedEvent};
pub use query::{EventFilter, EventReader};
pub use retry::RetryPolicy;
pub use schema::{SCHEMA_VERSION, ensure_schema};
pub use subscribers::SubscriberStore;
pub use types::{
    Attributes, IngestReceipt, NewSubscriber, Page, RawEvent, Session, SortOrder, SubscribeOutcome,
    Subscriber, SubscriberQuery, TrackedEvent, TrafficStats, Visitor, VisitorProfile,
};
