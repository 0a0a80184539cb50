//! In-memory storage backend.
//!
//! Thread-safe, volatile implementation of [`StateStore`]. It is intended for
//! embedded usage, tests, and as a reference implementation.

use std::sync::RwLock;

use crate::change::{ChangeCommit, ChangeEvent};
use crate::entity::{EntityId, EntityRecord};
use crate::storage::table::StateTable;
use crate::storage::traits::{AckOutcome, StateStore, StorageError, StoreStats};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::LockPoisoned(context)
}

/// Volatile state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    table: RwLock<StateTable>,
}

impl MemoryStateStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &EntityId) -> Result<Option<EntityRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("memory.get"))?;
        Ok(table.records.get(id).cloned())
    }

    fn commit(&self, commit: ChangeCommit) -> Result<(), StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("memory.commit"))?;
        table.validate_commit(&commit)?;
        table.apply_commit(commit);
        Ok(())
    }

    fn list_pending(&self, since: u64, limit: usize) -> Result<Vec<ChangeEvent>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("memory.list_pending"))?;
        Ok(table.list_pending(since, limit))
    }

    fn acknowledge(&self, sequence: u64) -> Result<AckOutcome, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("memory.acknowledge"))?;
        if let Some(outcome) = table.validate_ack(sequence)? {
            return Ok(outcome);
        }
        Ok(table.apply_ack(sequence))
    }

    fn scan_live(
        &self,
        first: Option<&EntityId>,
        last: Option<&EntityId>,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("memory.scan_live"))?;
        Ok(table.scan_live(first, last))
    }

    fn stats(&self) -> Result<StoreStats, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("memory.stats"))?;
        Ok(table.stats())
    }
}
