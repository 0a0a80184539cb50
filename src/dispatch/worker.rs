//! Background sync worker.
//!
//! Runs dispatch cycles on a dedicated thread, triggered by `kick()` after a
//! commit and by an optional periodic tick. Kicks are coalesced through a
//! bounded channel: while one is queued, further kicks are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender, TrySendError};
use serde::Deserialize;

use crate::error::ValidationError;

use super::dispatcher::{CancelToken, CycleOutcome, SyncDispatcher};

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Periodic cycle interval. Zero disables the tick; only kicks trigger.
    pub sync_interval_ms: u64,
    /// Queued kicks before further ones coalesce.
    pub trigger_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1_000,
            trigger_capacity: 1,
        }
    }
}

impl WorkerConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero trigger capacity.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.trigger_capacity == 0 {
            return Err(ValidationError::config("trigger_capacity", "must be at least 1"));
        }
        Ok(self)
    }
}

enum WorkerMsg {
    Kick,
}

/// Handle to the background sync thread. Dropping it stops the thread.
pub struct SyncWorker {
    trigger_tx: Sender<WorkerMsg>,
    cancel: CancelToken,
    coalesced: AtomicU64,
    cycles: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("cycles", &self.cycles())
            .field("coalesced_kicks", &self.coalesced_kicks())
            .finish_non_exhaustive()
    }
}

impl SyncWorker {
    /// Starts the worker thread.
    ///
    /// # Errors
    /// If the OS refuses to spawn the thread.
    pub fn spawn(dispatcher: Arc<SyncDispatcher>, cfg: WorkerConfig) -> std::io::Result<Self> {
        let (trigger_tx, trigger_rx) = bounded::<WorkerMsg>(cfg.trigger_capacity.max(1));
        let cancel = CancelToken::new();
        let cycles = Arc::new(AtomicU64::new(0));

        let interval = (cfg.sync_interval_ms > 0).then(|| Duration::from_millis(cfg.sync_interval_ms));
        let thread_cancel = cancel.clone();
        let thread_cycles = Arc::clone(&cycles);
        let join = thread::Builder::new()
            .name("fimsync-worker".to_string())
            .spawn(move || worker_loop(&dispatcher, interval, &thread_cancel, &thread_cycles, &trigger_rx))?;

        Ok(Self {
            trigger_tx,
            cancel,
            coalesced: AtomicU64::new(0),
            cycles,
            join: Mutex::new(Some(join)),
        })
    }

    /// Requests a cycle without blocking.
    pub fn kick(&self) {
        match self.trigger_tx.try_send(WorkerMsg::Kick) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Kicks that were merged into an already queued one.
    #[must_use]
    pub fn coalesced_kicks(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Cycles run by the worker so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Cancels any in-flight cycle and joins the thread.
    pub fn shutdown(&self) {
        // The loop polls the token at least every 100ms.
        self.cancel.cancel();

        let handle = self.join.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("sync worker thread panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    dispatcher: &SyncDispatcher,
    interval: Option<Duration>,
    cancel: &CancelToken,
    cycles: &AtomicU64,
    trigger_rx: &Receiver<WorkerMsg>,
) {
    let ticker = interval.map_or_else(never, tick);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        select! {
            recv(trigger_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            recv(ticker) -> _ => {}
            default(Duration::from_millis(100)) => continue,
        }

        // Keep draining while the batch or time budget cut a cycle short.
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let outcome = dispatcher.run_cycle(cancel);
            cycles.fetch_add(1, Ordering::Relaxed);
            if !matches!(outcome, CycleOutcome::Delivered { more: true, .. }) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeCommit, ChangeEvent, ChangeKind};
    use crate::dispatch::{DispatchConfig, FnNotificationSink, NotifyError};
    use crate::entity::{Attributes, EntityId, EntityRecord};
    use crate::logging::LogEmitter;
    use crate::storage::{MemoryStateStore, StateStore};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn seed(store: &MemoryStateStore, from: u64, to: u64) {
        for seq in from..=to {
            let id = EntityId::new(format!("/w/{seq}")).unwrap();
            let attrs = Attributes::file(seq, 0o644, Utc::now());
            store
                .commit(ChangeCommit {
                    record: EntityRecord {
                        id: id.clone(),
                        attributes: attrs.clone(),
                        last_sequence: seq,
                        tombstone: false,
                        updated_at: Utc::now(),
                    },
                    event: ChangeEvent {
                        identifier: id,
                        kind: ChangeKind::Created,
                        sequence: seq,
                        payload: Some(attrs),
                        detected_at: Utc::now(),
                    },
                })
                .unwrap();
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_kick_drains_pending() {
        let store = Arc::new(MemoryStateStore::new());
        let dispatcher = Arc::new(SyncDispatcher::new(
            store.clone(),
            Arc::new(LogEmitter::disabled()),
            DispatchConfig { batch_size: 3, ..DispatchConfig::default() },
        ));
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&delivered);
        dispatcher.register_sink(Arc::new(FnNotificationSink(move |_: &str, _: &[u8]| -> Result<(), NotifyError> {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let worker = SyncWorker::spawn(
            Arc::clone(&dispatcher),
            WorkerConfig { sync_interval_ms: 0, trigger_capacity: 1 },
        )
        .unwrap();

        seed(&store, 1, 10);
        worker.kick();
        assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 10));
        assert!(wait_until(|| store.stats().unwrap().pending == 0));
        assert!(wait_until(|| worker.cycles() >= 4));
    }

    #[test]
    fn test_periodic_tick_without_kick() {
        let store = Arc::new(MemoryStateStore::new());
        let dispatcher = Arc::new(SyncDispatcher::new(
            store.clone(),
            Arc::new(LogEmitter::disabled()),
            DispatchConfig::default(),
        ));
        dispatcher.register_sink(Arc::new(FnNotificationSink(|_: &str, _: &[u8]| -> Result<(), NotifyError> { Ok(()) })));

        seed(&store, 1, 2);
        let _worker = SyncWorker::spawn(
            dispatcher,
            WorkerConfig { sync_interval_ms: 10, trigger_capacity: 1 },
        )
        .unwrap();

        assert!(wait_until(|| store.stats().unwrap().pending == 0));
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let store = Arc::new(MemoryStateStore::new());
        let dispatcher = Arc::new(SyncDispatcher::new(
            store,
            Arc::new(LogEmitter::disabled()),
            DispatchConfig::default(),
        ));
        let worker = SyncWorker::spawn(dispatcher, WorkerConfig::default()).unwrap();
        worker.shutdown();
        worker.kick();
        assert!(worker.join.lock().unwrap().is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let cfg = WorkerConfig { trigger_capacity: 0, ..WorkerConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
