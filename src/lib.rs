//! Footfall - Visitor Tracking Library
//!
//! This crate provides the core functionality for the footfall tracking
//! service. It can be used as a library by other Rust projects, or run as a
//! standalone binary with the `footfall` executable.
//!
//! Several independent worker processes may serve the same database file.
//! Every write goes through a short immediate transaction that is retried with
//! backoff while another process holds the file lock, so the workers need no
//! coordination beyond the file itself.
//!
//! # Architecture
//!
//! - **Storage**: SQLite (WAL) engine, ingestion, queries and subscribers
//! - **Server**: JSON API over the storage services
//! - **Config**: YAML file plus CLI / environment overrides
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use footfall::storage::{RawEvent, StorageBuilder};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handles = StorageBuilder::new("data/visitor_tracking.db").build()?;
//!
//!     let receipt = handles
//!         .ingestor
//!         .ingest(&RawEvent::new("visitor-42", "page_view", Utc::now()))?;
//!     println!("stored event {} in session {}", receipt.event_id, receipt.session_id);
//!
//!     handles.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod server;
pub mod storage;

pub use storage::{
    ErrorClass, EventIngestor, EventReader, StorageBuilder, StorageError, StorageHandles,
    SubscriberStore,
};
