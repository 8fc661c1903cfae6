//! Maintenance actor with a dedicated thread and MPSC channel.
//!
//! One thread per process periodically closes idle sessions and runs a
//! passive WAL checkpoint. It owns no state needed for correctness: every
//! job is an ordinary `transact`, so if several processes run the same job
//! concurrently the second one simply finds nothing left to do.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::storage::StorageError;
use crate::storage::db::{CheckpointMode, SqliteStore};
use crate::storage::ingest::sweep_idle_sessions;

/// Default interval between idle-session sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between passive checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 16;

/// Commands sent to the maintenance actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Close sessions past their expiry now.
    SweepIdleSessions,
    /// Run a passive WAL checkpoint now.
    Checkpoint,
    /// Final checkpoint, then stop.
    Shutdown,
}

pub struct MaintenanceActor {
    store: SqliteStore,
    rx: Receiver<Command>,
    sweep_interval: Duration,
    checkpoint_interval: Duration,
    last_sweep: Instant,
    last_checkpoint: Instant,
}

impl MaintenanceActor {
    /// Spawn the actor thread.
    pub fn spawn(
        store: SqliteStore,
        sweep_interval: Duration,
        checkpoint_interval: Duration,
    ) -> Result<(JoinHandle<()>, SyncSender<Command>), StorageError> {
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let now = Instant::now();
        let mut actor = MaintenanceActor {
            store,
            rx,
            sweep_interval,
            checkpoint_interval,
            last_sweep: now,
            last_checkpoint: now,
        };

        let handle = thread::Builder::new()
            .name("footfall-maintenance".to_string())
            .spawn(move || actor.run())
            .map_err(|e| {
                StorageError::Internal(format!("failed to spawn maintenance thread: {e}"))
            })?;

        Ok((handle, tx))
    }

    fn run(&mut self) {
        tracing::info!(
            sweep_interval = ?self.sweep_interval,
            checkpoint_interval = ?self.checkpoint_interval,
            "Maintenance actor started"
        );

        loop {
            let now = Instant::now();
            let deadline = std::cmp::min(
                self.last_sweep + self.sweep_interval,
                self.last_checkpoint + self.checkpoint_interval,
            );
            let timeout = deadline.saturating_duration_since(now);

            match self.rx.recv_timeout(timeout) {
                Ok(cmd) => {
                    if self.handle_command(cmd) {
                        break; // Shutdown requested
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Channel disconnected, shutting down");
                    self.final_checkpoint();
                    break;
                }
            }

            if self.last_sweep.elapsed() >= self.sweep_interval {
                self.sweep();
            }
            if self.last_checkpoint.elapsed() >= self.checkpoint_interval {
                self.checkpoint();
            }
        }

        tracing::info!("Maintenance actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SweepIdleSessions => self.sweep(),
            Command::Checkpoint => self.checkpoint(),
            Command::Shutdown => {
                tracing::info!("Maintenance actor shutting down");
                self.final_checkpoint();
                return true;
            }
        }
        false
    }

    fn sweep(&mut self) {
        if let Err(e) = sweep_idle_sessions(&self.store, Utc::now()) {
            tracing::error!(error = %e, class = %e.class(), "Idle session sweep failed");
        }
        self.last_sweep = Instant::now();
    }

    fn checkpoint(&mut self) {
        match self.store.checkpoint(CheckpointMode::Passive) {
            Ok(stats) if stats.busy => {
                tracing::debug!("Passive checkpoint skipped, database busy");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Periodic checkpoint failed"),
        }
        self.last_checkpoint = Instant::now();
    }

    fn final_checkpoint(&self) {
        if let Err(e) = self.store.checkpoint(CheckpointMode::Truncate) {
            tracing::warn!(error = %e, "Final checkpoint failed");
        }
    }
}
