//! Abstract state store contract.
//!
//! The state store owns the entity table and the pending-change log. The
//! detector is its only writer (through [`StateStore::commit`]); the
//! dispatcher drains the pending log and acknowledges delivered events.

use std::io;

use thiserror::Error;

use crate::change::{ChangeCommit, ChangeEvent};
use crate::entity::{EntityId, EntityRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Local read or write failed. The operation was aborted and nothing
    /// was committed.
    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted data failed validation.
    #[error("Storage corruption: {0}")]
    Corruption(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A commit or acknowledgement would break sequence ordering.
    #[error("Sequence violation: {0}")]
    SequenceViolation(String),

    /// A thread panicked while holding a table lock.
    #[error("Poisoned lock: {0}")]
    LockPoisoned(&'static str),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Counters describing the store contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live (non-tombstoned) records.
    pub live_records: usize,
    /// Tombstones waiting for their deletion event to be acknowledged.
    pub tombstones: usize,
    /// Unacknowledged change events.
    pub pending: usize,
    /// Highest acknowledged sequence id.
    pub low_water_mark: u64,
    /// Highest sequence id ever committed.
    pub max_sequence: u64,
}

/// Outcome of acknowledging a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The event left the pending log.
    Removed {
        /// The entity's tombstone was purged along with it.
        purged: bool,
    },
    /// The sequence id was already at or below the low-water mark.
    AlreadyAcknowledged,
}

/// Result of a compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records written to the snapshot.
    pub records: usize,
    /// Pending events written to the snapshot.
    pub pending: usize,
    /// Log size before compaction.
    pub wal_size_before: u64,
    /// Log size after compaction.
    pub wal_size_after: u64,
}

/// Storage trait for the entity table and pending-change log.
///
/// # Safety Considerations
/// - `commit` must apply the record and event together or not at all
/// - readers copy data out and release locks before returning
pub trait StateStore: Send + Sync {
    /// Get a record by identifier, tombstones included.
    fn get(&self, id: &EntityId) -> Result<Option<EntityRecord>, StorageError>;

    /// Atomically write the updated record and append its change event.
    ///
    /// Commits must arrive in strictly increasing sequence order.
    fn commit(&self, commit: ChangeCommit) -> Result<(), StorageError>;

    /// Pending events with `sequence > since`, ascending, at most `limit`.
    fn list_pending(&self, since: u64, limit: usize) -> Result<Vec<ChangeEvent>, StorageError>;

    /// Remove a delivered event from the pending log and advance the
    /// low-water mark. Only the oldest pending event may be acknowledged.
    fn acknowledge(&self, sequence: u64) -> Result<AckOutcome, StorageError>;

    /// Live records ordered by identifier, optionally bounded (inclusive).
    fn scan_live(
        &self,
        first: Option<&EntityId>,
        last: Option<&EntityId>,
    ) -> Result<Vec<EntityRecord>, StorageError>;

    /// Store counters.
    fn stats(&self) -> Result<StoreStats, StorageError>;

    /// Highest acknowledged sequence id.
    fn low_water_mark(&self) -> Result<u64, StorageError> {
        Ok(self.stats()?.low_water_mark)
    }

    /// Highest sequence id ever committed.
    fn max_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.stats()?.max_sequence)
    }

    /// Returns true when the backend would benefit from [`compact`](Self::compact).
    fn needs_compaction(&self) -> bool {
        false
    }

    /// Fold the durable log into a snapshot. Volatile backends return `None`.
    fn compact(&self) -> Result<Option<CompactionResult>, StorageError> {
        Ok(None)
    }
}
