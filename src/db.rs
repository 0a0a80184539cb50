//! The FIM state database.
//!
//! [`FimDb`] ties the pieces together: scanners report observations through
//! `upsert` / `mark_deleted`, the detector commits the resulting change
//! events, and the dispatcher (driven by the caller or by an attached
//! [`SyncWorker`]) delivers them to the registered notification sink.
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use fimsync::{Attributes, ChangeKind, FimConfig, FimDb, FnNotificationSink, NotifyError};
//!
//! let db = FimDb::in_memory(FimConfig::default())?;
//! let attrs = Attributes::file(1024, 0o644, Utc::now()).with_content(b"root:x:0:0");
//!
//! assert_eq!(db.upsert("/etc/passwd", attrs.clone())?, Some(ChangeKind::Created));
//! assert_eq!(db.upsert("/etc/passwd", attrs)?, None);
//!
//! db.register_sink(Arc::new(FnNotificationSink(|_id: &str, _buf: &[u8]| -> Result<(), NotifyError> { Ok(()) })));
//! assert_eq!(db.run_sync().delivered(), 1);
//! # Ok::<(), fimsync::FimError>(())
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::change::{ChangeEvent, ChangeKind};
use crate::config::FimConfig;
use crate::detector::{ChangeDetector, Observation};
use crate::dispatch::{
    CancelToken, CycleOutcome, NotificationSink, SyncDispatcher, SyncStatus, SyncWorker,
    WorkerConfig,
};
use crate::entity::{Attributes, ContentHash, EntityId, EntityRecord};
use crate::error::{FimError, FimResult, StorageError};
use crate::logging::{LogEmitter, LogLevel, LogSink};
use crate::sequence::SequenceAllocator;
use crate::storage::{CompactionResult, MemoryStateStore, StateStore, StoreStats};

/// Digest over a range of live records.
///
/// Two databases holding the same live state produce the same digest,
/// whatever their sequence history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityChecksum {
    /// Lower bound of the range, inclusive; `None` for unbounded.
    pub first: Option<EntityId>,
    /// Upper bound of the range, inclusive; `None` for unbounded.
    pub last: Option<EntityId>,
    /// Live records covered.
    pub count: usize,
    /// blake3 over the compared fields of each record, in identifier order.
    pub digest: ContentHash,
}

struct ScanSession {
    started_at: DateTime<Utc>,
    seen: HashSet<EntityId>,
}

/// Change-synchronization engine over one state store.
pub struct FimDb {
    store: Arc<dyn StateStore>,
    sequence: Arc<SequenceAllocator>,
    detector: ChangeDetector,
    dispatcher: Arc<SyncDispatcher>,
    log: Arc<LogEmitter>,
    worker: Mutex<Option<SyncWorker>>,
    scan: Mutex<Option<ScanSession>>,
    auto_compact: bool,
}

impl fmt::Debug for FimDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FimDb")
            .field("sequence", &self.sequence)
            .field("detector", &self.detector)
            .field("dispatcher", &self.dispatcher)
            .field("auto_compact", &self.auto_compact)
            .finish_non_exhaustive()
    }
}

impl FimDb {
    /// Assembles a database over an existing store and allocator.
    ///
    /// The allocator is moved past the highest sequence the store has seen.
    ///
    /// # Errors
    /// Invalid configuration, an unreadable store, or a worker thread that
    /// fails to spawn.
    pub fn new(
        store: Arc<dyn StateStore>,
        sequence: Arc<SequenceAllocator>,
        config: FimConfig,
    ) -> FimResult<Self> {
        let config = config.validate()?;
        sequence.resume_above(store.max_sequence()?)?;

        let log = Arc::new(LogEmitter::disabled());
        let detector = ChangeDetector::new(Arc::clone(&store), Arc::clone(&sequence), config.detector);
        let dispatcher = Arc::new(SyncDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&log),
            config.dispatch,
        ));

        let db = Self {
            store,
            sequence,
            detector,
            dispatcher,
            log,
            worker: Mutex::new(None),
            scan: Mutex::new(None),
            auto_compact: config.auto_compact,
        };
        if let Some(worker_cfg) = config.worker {
            db.start_worker(worker_cfg)?;
        }
        Ok(db)
    }

    /// A volatile database.
    ///
    /// # Errors
    /// See [`FimDb::new`].
    pub fn in_memory(config: FimConfig) -> FimResult<Self> {
        Self::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(SequenceAllocator::in_memory()),
            config,
        )
    }

    /// Opens (or creates) a durable database in `dir`.
    ///
    /// # Errors
    /// Lock contention, corruption, or I/O failures.
    #[cfg(feature = "persistent")]
    pub fn open(dir: impl AsRef<std::path::Path>, config: FimConfig) -> FimResult<Self> {
        use crate::sequence::FileCounter;
        use crate::storage::open_store;

        let store = open_store(dir, Some(config.persistent.clone()))?;
        let counter = FileCounter::new(store.sequence_path());
        let sequence = SequenceAllocator::with_block(Box::new(counter), config.sequence.reserve_block)?;
        Self::new(Arc::new(store), Arc::new(sequence), config)
    }

    /// Records that `identifier` exists with `attributes`.
    ///
    /// Returns the kind of change committed, or `None` if nothing changed.
    ///
    /// # Errors
    /// Invalid identifier, storage or sequence failures. Nothing is
    /// committed on error.
    pub fn upsert(&self, identifier: &str, attributes: Attributes) -> FimResult<Option<ChangeKind>> {
        let id = EntityId::new(identifier)?;
        Ok(self
            .observe(&id, Observation::Present(attributes))?
            .map(|e| e.kind))
    }

    /// Records that `identifier` was confirmed removed.
    ///
    /// # Errors
    /// As for [`upsert`](Self::upsert).
    pub fn mark_deleted(&self, identifier: &str) -> FimResult<Option<ChangeKind>> {
        let id = EntityId::new(identifier)?;
        Ok(self.observe(&id, Observation::Removed)?.map(|e| e.kind))
    }

    /// Applies an observation and returns the committed event, if any.
    ///
    /// # Errors
    /// Storage or sequence failures.
    pub fn observe(&self, id: &EntityId, observation: Observation) -> FimResult<Option<ChangeEvent>> {
        if let Observation::Present(_) = observation {
            self.mark_seen(id);
        }

        let event = self.detector.observe(id, observation)?;
        if let Some(event) = &event {
            self.log.emit_with(LogLevel::Debug, || {
                format!("{} {} (seq {})", event.kind, event.identifier, event.sequence)
            });
            self.after_commit();
        }
        Ok(event)
    }

    /// Stored record for `identifier`, tombstones included.
    ///
    /// # Errors
    /// Invalid identifier or storage failure.
    pub fn get(&self, identifier: &str) -> FimResult<Option<EntityRecord>> {
        let id = EntityId::new(identifier)?;
        Ok(self.store.get(&id)?)
    }

    /// Pending events with a sequence id above `since`, ascending.
    ///
    /// # Errors
    /// Storage failure.
    pub fn list_pending(&self, since: u64) -> FimResult<Vec<ChangeEvent>> {
        Ok(self.store.list_pending(since, usize::MAX)?)
    }

    /// Store counters.
    ///
    /// # Errors
    /// Storage failure.
    pub fn stats(&self) -> FimResult<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Registers the notification sink and wakes the worker to backfill.
    pub fn register_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.dispatcher.register_sink(sink);
        self.kick_worker();
    }

    /// Removes the notification sink. Events keep accumulating.
    pub fn clear_sink(&self) {
        self.dispatcher.clear_sink();
    }

    /// Sets or removes the host log sink.
    pub fn set_log_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        self.log.set_sink(sink);
    }

    /// The emitter used for host-facing diagnostics.
    #[must_use]
    pub fn log_emitter(&self) -> &Arc<LogEmitter> {
        &self.log
    }

    /// Runs one dispatch cycle on the calling thread.
    pub fn run_sync(&self) -> CycleOutcome {
        self.dispatcher.run_cycle(&CancelToken::new())
    }

    /// Runs one dispatch cycle that stops when `cancel` fires.
    pub fn run_sync_with(&self, cancel: &CancelToken) -> CycleOutcome {
        self.dispatcher.run_cycle(cancel)
    }

    /// Dispatcher progress and pending counters.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.dispatcher.status()
    }

    /// The dispatcher, for hosts that drive cycles themselves.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.dispatcher
    }

    /// The last sequence id handed out.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.sequence.current()
    }

    /// Starts (or restarts) the background sync worker.
    ///
    /// # Errors
    /// Invalid configuration or a thread that fails to spawn.
    pub fn start_worker(&self, cfg: WorkerConfig) -> FimResult<()> {
        let cfg = cfg.validate()?;
        let worker = SyncWorker::spawn(Arc::clone(&self.dispatcher), cfg)
            .map_err(|e| FimError::internal(format!("failed to spawn sync worker: {e}")))?;
        worker.kick();

        let previous = {
            let mut slot = self.worker.lock().unwrap_or_else(|p| p.into_inner());
            slot.replace(worker)
        };
        drop(previous);
        Ok(())
    }

    /// Stops the background worker, cancelling an in-flight cycle.
    pub fn stop_worker(&self) {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(worker);
    }

    /// Whether a background worker is running.
    #[must_use]
    pub fn has_worker(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Starts a full scan. Live entities not observed as present before
    /// [`end_scan`](Self::end_scan) are then marked deleted.
    ///
    /// Starting a scan while one is open discards the open one.
    pub fn begin_scan(&self) {
        let mut scan = self.scan.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = scan.as_ref() {
            self.log.emit_with(LogLevel::Warning, || {
                format!(
                    "scan started at {} abandoned after {} observations",
                    previous.started_at,
                    previous.seen.len()
                )
            });
        }
        *scan = Some(ScanSession {
            started_at: Utc::now(),
            seen: HashSet::new(),
        });
    }

    /// Closes the open scan and returns the number of deletions it caused.
    ///
    /// Returns 0 when no scan is open.
    ///
    /// # Errors
    /// Storage or sequence failures. Deletions committed before the failure
    /// stay committed.
    pub fn end_scan(&self) -> FimResult<usize> {
        let Some(session) = self.scan.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return Ok(0);
        };

        let mut deleted = 0;
        for record in self.store.scan_live(None, None)? {
            if session.seen.contains(&record.id) {
                continue;
            }
            if self.observe(&record.id, Observation::Removed)?.is_some() {
                deleted += 1;
            }
        }

        self.log.emit_with(LogLevel::Info, || {
            format!(
                "scan started at {} finished: {} observed, {deleted} deleted",
                session.started_at,
                session.seen.len()
            )
        });
        Ok(deleted)
    }

    /// Whether a scan was begun and not yet ended.
    #[must_use]
    pub fn scan_in_progress(&self) -> bool {
        self.scan.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Digest over every live record.
    ///
    /// # Errors
    /// Storage failure.
    pub fn integrity_checksum(&self) -> FimResult<IntegrityChecksum> {
        self.checksum(None, None)
    }

    /// Digest over live records with identifiers in `first..=last`.
    ///
    /// # Errors
    /// Invalid identifiers or storage failure.
    pub fn range_checksum(&self, first: &str, last: &str) -> FimResult<IntegrityChecksum> {
        let first = EntityId::new(first)?;
        let last = EntityId::new(last)?;
        self.checksum(Some(&first), Some(&last))
    }

    fn checksum(&self, first: Option<&EntityId>, last: Option<&EntityId>) -> FimResult<IntegrityChecksum> {
        let records = self.store.scan_live(first, last)?;

        let mut hasher = blake3::Hasher::new();
        for record in &records {
            let attrs = &record.attributes;
            hasher.update(record.id.as_str().as_bytes());
            hasher.update(&[0]);
            match &attrs.hash {
                Some(hash) => {
                    hasher.update(&[1]);
                    hasher.update(hash.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
            hasher.update(&attrs.size.to_le_bytes());
            hasher.update(&attrs.permissions.to_le_bytes());
            hasher.update(&attrs.mtime.timestamp().to_le_bytes());
            hasher.update(&attrs.mtime.timestamp_subsec_nanos().to_le_bytes());
        }

        Ok(IntegrityChecksum {
            first: records.first().map(|r| r.id.clone()),
            last: records.last().map(|r| r.id.clone()),
            count: records.len(),
            digest: ContentHash::from_bytes(*hasher.finalize().as_bytes()),
        })
    }

    /// Compacts the store now.
    ///
    /// # Errors
    /// Storage failure; the durable log is left intact.
    pub fn compact(&self) -> FimResult<Option<CompactionResult>> {
        Ok(self.store.compact()?)
    }

    fn mark_seen(&self, id: &EntityId) {
        let mut scan = self.scan.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = scan.as_mut() {
            session.seen.insert(id.clone());
        }
    }

    fn kick_worker(&self) {
        if let Ok(worker) = self.worker.lock() {
            if let Some(worker) = worker.as_ref() {
                worker.kick();
            }
        }
    }

    fn after_commit(&self) {
        self.kick_worker();

        if self.auto_compact && self.store.needs_compaction() {
            match self.store.compact() {
                Ok(Some(result)) => self.log.emit_with(LogLevel::Debug, || {
                    format!(
                        "compacted {} records, log {} -> {} bytes",
                        result.records, result.wal_size_before, result.wal_size_after
                    )
                }),
                Ok(None) => {}
                Err(e) => self.report_storage(&e, "automatic compaction failed"),
            }
        }
    }

    fn report_storage(&self, error: &StorageError, context: &str) {
        self.log.emit_with(LogLevel::Error, || format!("{context}: {error}"));
    }
}

impl Drop for FimDb {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{FnNotificationSink, NotifyError};
    use crate::logging::LogSinkError;
    use chrono::TimeZone;

    fn attrs(size: u64) -> Attributes {
        Attributes::file(size, 0o644, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    fn db() -> FimDb {
        FimDb::in_memory(FimConfig::default()).unwrap()
    }

    #[test]
    fn test_upsert_and_delete_kinds() {
        let db = db();
        assert_eq!(db.upsert("/etc/hosts", attrs(1)).unwrap(), Some(ChangeKind::Created));
        assert_eq!(db.upsert("/etc/hosts", attrs(1)).unwrap(), None);
        assert_eq!(db.upsert("/etc/hosts", attrs(2)).unwrap(), Some(ChangeKind::Modified));
        assert_eq!(db.mark_deleted("/etc/hosts").unwrap(), Some(ChangeKind::Deleted));
        assert_eq!(db.mark_deleted("/etc/hosts").unwrap(), None);
        assert_eq!(db.current_sequence(), 3);

        let pending: Vec<_> = db.list_pending(0).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(pending, [1, 2, 3]);
        assert_eq!(db.list_pending(2).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let db = db();
        assert!(db.upsert("", attrs(1)).unwrap_err().is_validation());
        assert!(db.mark_deleted("").unwrap_err().is_validation());
        assert_eq!(db.current_sequence(), 0);
    }

    #[test]
    fn test_scan_sweep_deletes_unseen() {
        let db = db();
        for f in ["/a", "/b", "/c", "/d"] {
            db.upsert(f, attrs(1)).unwrap();
        }
        db.mark_deleted("/d").unwrap();

        db.begin_scan();
        assert!(db.scan_in_progress());
        db.upsert("/a", attrs(1)).unwrap();
        db.upsert("/c", attrs(5)).unwrap();
        db.upsert("/e", attrs(1)).unwrap();
        assert_eq!(db.end_scan().unwrap(), 1);
        assert!(!db.scan_in_progress());

        assert!(db.get("/b").unwrap().unwrap().tombstone);
        assert!(db.get("/a").unwrap().unwrap().is_live());
        assert!(db.get("/e").unwrap().unwrap().is_live());
        assert_eq!(db.end_scan().unwrap(), 0);
    }

    #[test]
    fn test_checksum_tracks_live_state_only() {
        let left = db();
        let right = db();

        left.upsert("/x", attrs(1)).unwrap();
        left.upsert("/y", attrs(2)).unwrap();

        right.upsert("/y", attrs(9)).unwrap();
        right.upsert("/y", attrs(2)).unwrap();
        right.upsert("/z", attrs(3)).unwrap();
        right.mark_deleted("/z").unwrap();
        right.upsert("/x", attrs(1)).unwrap();

        let l = left.integrity_checksum().unwrap();
        let r = right.integrity_checksum().unwrap();
        assert_eq!(l, r);
        assert_eq!(l.count, 2);
        assert_eq!(l.first.as_ref().map(EntityId::as_str), Some("/x"));

        right.upsert("/x", attrs(4)).unwrap();
        assert_ne!(left.integrity_checksum().unwrap().digest, right.integrity_checksum().unwrap().digest);
        assert_eq!(
            left.range_checksum("/y", "/z").unwrap(),
            right.range_checksum("/y", "/z").unwrap()
        );
    }

    #[test]
    fn test_failing_log_sink_does_not_affect_sync() {
        let db = db();
        struct Unavailable;
        impl LogSink for Unavailable {
            fn log(&self, _: LogLevel, _: &str) -> Result<(), LogSinkError> {
                Err(LogSinkError::new("syslog unavailable"))
            }
        }

        db.set_log_sink(Some(Arc::new(Unavailable)));
        db.register_sink(Arc::new(FnNotificationSink(|_: &str, _: &[u8]| -> Result<(), NotifyError> { Ok(()) })));

        db.upsert("/etc/a", attrs(1)).unwrap();
        db.upsert("/etc/b", attrs(1)).unwrap();
        assert_eq!(db.run_sync().delivered(), 2);
        assert!(db.log_emitter().dropped() > 0);
    }

    #[test]
    fn test_status_reports_backlog() {
        let db = db();
        db.register_sink(Arc::new(FnNotificationSink(|_: &str, _: &[u8]| -> Result<(), NotifyError> {
            Err(NotifyError::new("peer down"))
        })));
        db.upsert("/etc/a", attrs(1)).unwrap();

        let cfg = db.dispatcher().config().clone();
        assert!(matches!(db.run_sync(), CycleOutcome::Blocked { sequence: 1, .. }));
        let status = db.status();
        assert_eq!(status.pending, 1);
        assert_eq!(status.blocked_on, Some(1));
        assert_eq!(status.failed_attempts_total, u64::from(cfg.max_attempts));
    }
}
