//! Durable state store.
//!
//! Wraps:
//! - the in-memory [`StateTable`] for reads
//! - the WAL for durable writes (logged before applied)
//! - the snapshot manager for compaction

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::change::{ChangeCommit, ChangeEvent};
use crate::entity::{EntityId, EntityRecord};
use crate::storage::table::StateTable;
use crate::storage::traits::{
    AckOutcome, CompactionResult, StateStore, StorageError, StoreStats,
};

use super::file_lock::FileLock;
use super::snapshot::SnapshotManager;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::LockPoisoned(context)
}

fn corruption(context: &str, e: &std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        StorageError::Corruption(format!("{context}: {e}"))
    } else {
        StorageError::Io(std::io::Error::new(e.kind(), format!("{context}: {e}")))
    }
}

/// State store persisted to a directory.
pub struct PersistentStateStore {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    snapshots: Mutex<SnapshotManager>,
    table: RwLock<StateTable>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStateStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentStateStore {
    /// Open or create a persistent store in `dir`.
    ///
    /// Loads the newest snapshot, then replays the WAL on top of it.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;

        let lock = FileLock::acquire(dir)?;

        let snapshots = SnapshotManager::open(&dir.join("snapshots"))
            .map_err(|e| corruption("failed to open snapshots", &e))?;
        let mut table = snapshots
            .load_latest()
            .map_err(|e| corruption("failed to load snapshot", &e))?;

        let wal = WriteAheadLog::open(&dir.join("fim.wal"), config.sync_on_write)
            .map_err(|e| corruption("failed to open WAL", &e))?;

        let replayed = Self::replay(&wal, &mut table)?;
        if replayed > 0 {
            info!(
                dir = %dir.display(),
                replayed,
                pending = table.pending.len(),
                "replayed WAL entries"
            );
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            snapshots: Mutex::new(snapshots),
            table: RwLock::new(table),
            config,
        })
    }

    /// Replay WAL entries into `table`.
    fn replay(wal: &WriteAheadLog, table: &mut StateTable) -> Result<usize, StorageError> {
        let iter = wal.iter().map_err(|e| corruption("failed to iterate WAL", &e))?;

        let mut count = 0;
        for entry_result in iter {
            let entry = entry_result.map_err(|e| corruption("corrupted WAL entry", &e))?;

            match entry.kind {
                WalEntryKind::Commit(commit) => table.replay_commit(commit)?,
                WalEntryKind::Ack { sequence } => table.replay_ack(sequence)?,
                WalEntryKind::Checkpoint { max_sequence } => {
                    debug!(max_sequence, "WAL checkpoint marker");
                }
            }
            count += 1;
        }

        Ok(count)
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the sequence counter file for this database.
    #[must_use]
    pub fn sequence_path(&self) -> PathBuf {
        self.dir.join(super::SEQUENCE_FILE)
    }

    /// Current WAL size in bytes, or `None` if the file cannot be inspected.
    pub fn wal_size(&self) -> Option<u64> {
        match self.wal.size_bytes() {
            Ok(size) => Some(size),
            Err(e) => {
                warn!(dir = %self.dir.display(), "cannot read WAL size: {e}");
                None
            }
        }
    }

    /// Whether a snapshot exists.
    pub fn has_snapshot(&self) -> bool {
        self.snapshots
            .lock()
            .map(|s| s.latest().is_some())
            .unwrap_or(false)
    }
}

impl StateStore for PersistentStateStore {
    fn get(&self, id: &EntityId) -> Result<Option<EntityRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("persistent.get"))?;
        Ok(table.records.get(id).cloned())
    }

    fn commit(&self, commit: ChangeCommit) -> Result<(), StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("persistent.commit"))?;
        table.validate_commit(&commit)?;

        // Logged under the table lock so WAL order matches apply order.
        self.wal.append(WalEntryKind::Commit(commit.clone()))?;
        table.apply_commit(commit);
        Ok(())
    }

    fn list_pending(&self, since: u64, limit: usize) -> Result<Vec<ChangeEvent>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("persistent.list_pending"))?;
        Ok(table.list_pending(since, limit))
    }

    fn acknowledge(&self, sequence: u64) -> Result<AckOutcome, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("persistent.acknowledge"))?;
        if let Some(outcome) = table.validate_ack(sequence)? {
            return Ok(outcome);
        }

        self.wal.append(WalEntryKind::Ack { sequence })?;
        Ok(table.apply_ack(sequence))
    }

    fn scan_live(
        &self,
        first: Option<&EntityId>,
        last: Option<&EntityId>,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("persistent.scan_live"))?;
        Ok(table.scan_live(first, last))
    }

    fn stats(&self) -> Result<StoreStats, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("persistent.stats"))?;
        Ok(table.stats())
    }

    fn needs_compaction(&self) -> bool {
        self.wal_size()
            .is_some_and(|size| size > self.config.max_wal_size)
    }

    /// Compact the WAL into a snapshot.
    ///
    /// This operation:
    /// 1. Snapshots the table under its write lock (commits wait)
    /// 2. Writes a checkpoint marker to the WAL
    /// 3. Truncates the WAL
    ///
    /// If it fails partway through, the WAL still holds everything and
    /// replay skips whatever the snapshot already covers.
    fn compact(&self) -> Result<Option<CompactionResult>, StorageError> {
        let table = self.table.write().map_err(|_| lock_err("persistent.compact"))?;
        let mut snapshots = self.snapshots.lock().map_err(|_| lock_err("persistent.snapshots"))?;

        if self.wal.position() == 0 && snapshots.latest().is_some() {
            return Ok(None);
        }

        let wal_size_before = self.wal.size_bytes()?;

        let snapshot = snapshots.create_writer().write(&table)?;
        let records = table.records.len();
        let pending = table.pending.len();
        snapshots.install(snapshot);

        self.wal.append(WalEntryKind::Checkpoint {
            max_sequence: table.max_sequence,
        })?;
        self.wal.truncate()?;

        let wal_size_after = self.wal.size_bytes()?;
        debug!(records, pending, wal_size_before, wal_size_after, "compacted state store");

        Ok(Some(CompactionResult {
            records,
            pending,
            wal_size_before,
            wal_size_after,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::entity::Attributes;
    use chrono::Utc;
    use tempfile::tempdir;

    fn commit(id: &str, seq: u64, kind: ChangeKind) -> ChangeCommit {
        let id = EntityId::new(id).unwrap();
        let attrs = Attributes::file(seq * 10, 0o600, Utc::now());
        ChangeCommit {
            record: EntityRecord {
                id: id.clone(),
                attributes: attrs.clone(),
                last_sequence: seq,
                tombstone: kind == ChangeKind::Deleted,
                updated_at: Utc::now(),
            },
            event: ChangeEvent {
                identifier: id,
                kind,
                sequence: seq,
                payload: (kind != ChangeKind::Deleted).then_some(attrs),
                detected_at: Utc::now(),
            },
        }
    }

    fn open(dir: &Path) -> PersistentStateStore {
        PersistentStateStore::open(dir, PersistentConfig::default()).unwrap()
    }

    #[test]
    fn test_commits_and_acks_survive_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = open(dir.path());
            store.commit(commit("/etc/passwd", 1, ChangeKind::Created)).unwrap();
            store.commit(commit("/etc/shadow", 2, ChangeKind::Created)).unwrap();
            store.acknowledge(1).unwrap();
        }

        let store = open(dir.path());
        let stats = store.stats().unwrap();
        assert_eq!(stats.live_records, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.low_water_mark, 1);
        assert_eq!(stats.max_sequence, 2);

        let pending = store.list_pending(0, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, 2);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _store = open(dir.path());

        let err = PersistentStateStore::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == std::io::ErrorKind::WouldBlock));
    }

    #[test]
    fn test_compaction_then_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = open(dir.path());
            for seq in 1..=10 {
                store.commit(commit(&format!("/bin/f{seq}"), seq, ChangeKind::Created)).unwrap();
            }
            for seq in 1..=4 {
                store.acknowledge(seq).unwrap();
            }

            let before = store.wal_size().unwrap();
            let result = store.compact().unwrap().unwrap();
            assert_eq!(result.records, 10);
            assert_eq!(result.pending, 6);
            assert!(result.wal_size_after < before);
            assert!(store.has_snapshot());

            store.commit(commit("/bin/f11", 11, ChangeKind::Created)).unwrap();
        }

        let store = open(dir.path());
        let stats = store.stats().unwrap();
        assert_eq!(stats.live_records, 11);
        assert_eq!(stats.pending, 7);
        assert_eq!(stats.low_water_mark, 4);
        assert_eq!(stats.max_sequence, 11);
    }

    #[test]
    fn test_compaction_of_idle_store_is_noop() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        // First compaction writes the (empty) snapshot, second has no work.
        assert!(store.compact().unwrap().is_some());
        assert!(store.compact().unwrap().is_none());
    }

    #[test]
    fn test_rejected_commit_is_not_logged() {
        let dir = tempdir().unwrap();

        {
            let store = open(dir.path());
            store.commit(commit("/a", 5, ChangeKind::Created)).unwrap();
            assert!(store.commit(commit("/b", 3, ChangeKind::Created)).is_err());
        }

        let store = open(dir.path());
        assert!(store.get(&EntityId::new("/b").unwrap()).unwrap().is_none());
        assert_eq!(store.max_sequence().unwrap(), 5);
    }

    #[test]
    fn test_deleted_record_purged_after_ack_and_reopen() {
        let dir = tempdir().unwrap();
        let id = EntityId::new("/tmp/x").unwrap();

        {
            let store = open(dir.path());
            store.commit(commit("/tmp/x", 1, ChangeKind::Created)).unwrap();
            store.commit(commit("/tmp/x", 2, ChangeKind::Deleted)).unwrap();
            assert!(store.get(&id).unwrap().unwrap().tombstone);
            store.acknowledge(1).unwrap();
            assert_eq!(store.acknowledge(2).unwrap(), AckOutcome::Removed { purged: true });
        }

        let store = open(dir.path());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_failed_wal_append_leaves_no_trace() {
        let dir = tempdir().unwrap();

        {
            let store = open(dir.path());
            store.commit(commit("/f/1", 1, ChangeKind::Created)).unwrap();

            store.wal.inject_append_failure();
            assert!(store.commit(commit("/f/2", 2, ChangeKind::Created)).is_err());
            assert!(store.get(&EntityId::new("/f/2").unwrap()).unwrap().is_none());

            store.commit(commit("/f/3", 3, ChangeKind::Created)).unwrap();
            store.acknowledge(1).unwrap();
            store.acknowledge(3).unwrap();
        }

        let store = open(dir.path());
        assert!(store.get(&EntityId::new("/f/2").unwrap()).unwrap().is_none());
        let stats = store.stats().unwrap();
        assert_eq!(stats.live_records, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.low_water_mark, 3);
    }

    #[test]
    fn test_unreadable_wal_size_disables_compaction_check() {
        let dir = tempdir().unwrap();
        let store = PersistentStateStore::open(
            dir.path(),
            PersistentConfig {
                max_wal_size: 0,
                sync_on_write: false,
            },
        )
        .unwrap();
        store.commit(commit("/f/1", 1, ChangeKind::Created)).unwrap();
        assert!(store.needs_compaction());

        fs::remove_file(dir.path().join("fim.wal")).unwrap();
        assert_eq!(store.wal_size(), None);
        assert!(!store.needs_compaction());
    }
}
