//! Storage administration facade.

use std::sync::mpsc::SyncSender;

use crate::storage::StorageError;
use crate::storage::actor::Command;

/// Sends maintenance commands to this process's actor.
#[derive(Clone)]
pub struct StorageAdmin {
    tx: SyncSender<Command>,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(tx: SyncSender<Command>) -> Self {
        Self { tx }
    }

    pub fn sweep_idle_sessions(&self) -> Result<(), StorageError> {
        self.tx
            .try_send(Command::SweepIdleSessions)
            .map_err(|_| StorageError::ChannelSend)
    }

    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.tx
            .try_send(Command::Checkpoint)
            .map_err(|_| StorageError::ChannelSend)
    }

    pub fn shutdown(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Shutdown)
            .map_err(|_| StorageError::ChannelSend)
    }
}
