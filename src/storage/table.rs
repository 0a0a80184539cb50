//! In-memory state table shared by every backend.
//!
//! Backends wrap a [`StateTable`] in a lock; the persistent backend also
//! logs each mutation before applying it and snapshots the whole table on
//! compaction.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::change::{ChangeCommit, ChangeEvent, ChangeKind};
use crate::entity::{EntityId, EntityRecord};

use super::traits::{AckOutcome, StorageError, StoreStats};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTable {
    pub records: BTreeMap<EntityId, EntityRecord>,
    pub pending: BTreeMap<u64, ChangeEvent>,
    pub low_water_mark: u64,
    pub max_sequence: u64,
}

impl StateTable {
    /// Checks that `commit` may be applied without mutating anything.
    pub fn validate_commit(&self, commit: &ChangeCommit) -> Result<(), StorageError> {
        let seq = commit.sequence();
        if seq <= self.max_sequence {
            return Err(StorageError::SequenceViolation(format!(
                "commit sequence {seq} is not above last committed {}",
                self.max_sequence
            )));
        }
        if commit.record.last_sequence != seq {
            return Err(StorageError::SequenceViolation(format!(
                "record sequence {} does not match event sequence {seq}",
                commit.record.last_sequence
            )));
        }
        if commit.record.id != commit.event.identifier {
            return Err(StorageError::Backend(format!(
                "record {} does not match event identifier {}",
                commit.record.id, commit.event.identifier
            )));
        }
        if commit.record.tombstone != (commit.event.kind == ChangeKind::Deleted) {
            return Err(StorageError::Backend(format!(
                "tombstone flag inconsistent with {} event for {}",
                commit.event.kind, commit.record.id
            )));
        }
        Ok(())
    }

    /// Applies a validated commit.
    pub fn apply_commit(&mut self, commit: ChangeCommit) {
        let seq = commit.sequence();
        self.records.insert(commit.record.id.clone(), commit.record);
        self.pending.insert(seq, commit.event);
        self.max_sequence = seq;
    }

    /// Checks that `sequence` is acknowledgeable.
    pub fn validate_ack(&self, sequence: u64) -> Result<Option<AckOutcome>, StorageError> {
        if sequence <= self.low_water_mark && !self.pending.contains_key(&sequence) {
            return Ok(Some(AckOutcome::AlreadyAcknowledged));
        }
        match self.pending.keys().next() {
            Some(&oldest) if oldest == sequence => Ok(None),
            Some(&oldest) => Err(StorageError::SequenceViolation(format!(
                "cannot acknowledge {sequence} before oldest pending {oldest}"
            ))),
            None => Err(StorageError::SequenceViolation(format!(
                "cannot acknowledge {sequence}: nothing pending"
            ))),
        }
    }

    /// Acknowledges the oldest pending event, purging its tombstone when the
    /// event is the entity's latest deletion.
    pub fn apply_ack(&mut self, sequence: u64) -> AckOutcome {
        let Some(event) = self.pending.remove(&sequence) else {
            return AckOutcome::AlreadyAcknowledged;
        };
        self.low_water_mark = self.low_water_mark.max(sequence);

        let mut purged = false;
        if event.kind == ChangeKind::Deleted {
            let stale = self
                .records
                .get(&event.identifier)
                .is_some_and(|r| r.tombstone && r.last_sequence == sequence);
            if stale {
                self.records.remove(&event.identifier);
                purged = true;
            }
        }

        AckOutcome::Removed { purged }
    }

    /// Replays a logged commit; commits already folded into a snapshot are
    /// skipped.
    pub fn replay_commit(&mut self, commit: ChangeCommit) -> Result<(), StorageError> {
        if commit.sequence() <= self.max_sequence {
            return Ok(());
        }
        self.validate_commit(&commit)?;
        self.apply_commit(commit);
        Ok(())
    }

    /// Replays a logged acknowledgement.
    pub fn replay_ack(&mut self, sequence: u64) -> Result<(), StorageError> {
        if self.validate_ack(sequence)?.is_none() {
            self.apply_ack(sequence);
        }
        Ok(())
    }

    pub fn list_pending(&self, since: u64, limit: usize) -> Vec<ChangeEvent> {
        self.pending
            .range((Bound::Excluded(since), Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn scan_live(&self, first: Option<&EntityId>, last: Option<&EntityId>) -> Vec<EntityRecord> {
        if let (Some(f), Some(l)) = (first, last) {
            if f > l {
                return Vec::new();
            }
        }
        let lower = first.map_or(Bound::Unbounded, Bound::Included);
        let upper = last.map_or(Bound::Unbounded, Bound::Included);
        self.records
            .range::<EntityId, _>((lower, upper))
            .filter(|(_, r)| r.is_live())
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let tombstones = self.records.values().filter(|r| r.tombstone).count();
        StoreStats {
            live_records: self.records.len() - tombstones,
            tombstones,
            pending: self.pending.len(),
            low_water_mark: self.low_water_mark,
            max_sequence: self.max_sequence,
        }
    }
}
