//! Storage builder and handles.
//!
//! Wires the engine, schema, services and maintenance actor together for
//! one process.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::storage::StorageError;
use crate::storage::actor::{DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_SWEEP_INTERVAL, MaintenanceActor};
use crate::storage::admin::StorageAdmin;
use crate::storage::db::{SqliteStore, StoreOptions, SynchronousMode};
use crate::storage::ingest::{EventIngestor, IngestPolicy};
use crate::storage::query::{DEFAULT_MAX_HISTORY_LIMIT, EventReader};
use crate::storage::retry::RetryPolicy;
use crate::storage::schema::ensure_schema;
use crate::storage::subscribers::SubscriberStore;

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    db_path: PathBuf,
    options: StoreOptions,
    policy: IngestPolicy,
    max_history_limit: u32,
    sweep_interval: Duration,
    checkpoint_interval: Duration,
}

impl StorageBuilder {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            options: StoreOptions::default(),
            policy: IngestPolicy::default(),
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    /// Replace all engine options at once.
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Bounded wait for the file lock.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.options.busy_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn read_pool_size(mut self, size: u32) -> Self {
        self.options.read_pool_size = size;
        self
    }

    pub fn write_pool_size(mut self, size: u32) -> Self {
        self.options.write_pool_size = size;
        self
    }

    pub fn synchronous(mut self, mode: SynchronousMode) -> Self {
        self.options.synchronous = mode;
        self
    }

    pub fn ingest_policy(mut self, policy: IngestPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_history_limit(mut self, limit: u32) -> Self {
        self.max_history_limit = limit;
        self
    }

    /// Interval between idle-session sweeps.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Interval between passive WAL checkpoints.
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Open the file, ensure the schema and start the maintenance actor.
    pub fn build(self) -> Result<StorageHandles, StorageError> {
        let store = SqliteStore::open(&self.db_path, &self.options)?;
        ensure_schema(&store)?;

        let (actor_handle, tx) =
            MaintenanceActor::spawn(store.clone(), self.sweep_interval, self.checkpoint_interval)?;

        Ok(StorageHandles {
            ingestor: EventIngestor::new(store.clone(), self.policy),
            reader: EventReader::new(store.clone()).with_max_history_limit(self.max_history_limit),
            subscribers: SubscriberStore::new(store.clone()),
            admin: StorageAdmin::new(tx),
            store,
            actor_handle: Some(actor_handle),
        })
    }
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Event ingestion.
    pub ingestor: EventIngestor,
    /// Read-side queries.
    pub reader: EventReader,
    /// E-mail subscribers.
    pub subscribers: SubscriberStore,
    /// Maintenance commands.
    pub admin: StorageAdmin,
    store: SqliteStore,
    actor_handle: Option<JoinHandle<()>>,
}

impl StorageHandles {
    /// The underlying engine handle.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Stop the maintenance actor (which runs the final checkpoint) and
    /// release this handle's connections.
    pub fn shutdown(mut self) -> Result<(), StorageError> {
        self.admin.shutdown()?;

        if let Some(handle) = self.actor_handle.take() {
            handle.join().map_err(|_| {
                StorageError::Internal("failed to join maintenance thread".to_string())
            })?;
        }

        tracing::info!(path = %self.store.path().display(), "Storage shut down");
        Ok(())
    }
}

impl Drop for StorageHandles {
    fn drop(&mut self) {
        if self.actor_handle.is_some() {
            let _ = self.admin.shutdown();
            if let Some(handle) = self.actor_handle.take() {
                let _ = handle.join();
            }
        }
    }
}
