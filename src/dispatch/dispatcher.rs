//! Sync dispatcher.
//!
//! Drains the pending-change log in sequence order and hands each event to
//! the registered [`NotificationSink`]. An event is acknowledged (and the
//! low-water mark advanced) only after the sink returns success. A failing
//! sink blocks the cycle on that event; the next cycle retries it first, so
//! nothing is skipped or reordered.
//!
//! One cycle runs at a time. A concurrent `run_cycle` returns
//! [`CycleOutcome::Busy`] instead of waiting.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::ChangeEvent;
use crate::error::ValidationError;
use crate::logging::{LogEmitter, LogLevel};
use crate::storage::{StateStore, StorageError};

/// Failure reported by a notification sink (transport down, peer rejected).
#[derive(Debug, Clone, Error)]
#[error("notification failed: {message}")]
pub struct NotifyError {
    /// Description passed on to the status report and the log.
    pub message: String,
}

impl NotifyError {
    /// Creates an error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Consumer of synchronization events.
///
/// `buffer` is a [`SyncMessage`](crate::change::SyncMessage) encoded as
/// JSON. Returning `Ok` acknowledges the event; it will not be offered
/// again.
pub trait NotificationSink: Send + Sync {
    /// Delivers one event. Called from the dispatcher's cycle, one event at
    /// a time in sequence order.
    fn notify(&self, identifier: &str, buffer: &[u8]) -> Result<(), NotifyError>;
}

/// Adapts a closure into a [`NotificationSink`].
pub struct FnNotificationSink<F>(pub F);

impl<F> NotificationSink for FnNotificationSink<F>
where
    F: Fn(&str, &[u8]) -> Result<(), NotifyError> + Send + Sync,
{
    fn notify(&self, identifier: &str, buffer: &[u8]) -> Result<(), NotifyError> {
        (self.0)(identifier, buffer)
    }
}

/// Delivery limits of a dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Max events delivered per cycle.
    pub batch_size: usize,
    /// Delivery attempts per event within one cycle before blocking.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff.
    pub max_backoff_ms: u64,
    /// Wall-time budget of one cycle, checked after every acknowledged event.
    pub cycle_budget_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            max_attempts: 3,
            retry_backoff_ms: 50,
            max_backoff_ms: 1_000,
            cycle_budget_ms: 5_000,
        }
    }
}

impl DispatchConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero batch size, attempt count or budget.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::config("batch_size", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::config("max_attempts", "must be at least 1"));
        }
        if self.cycle_budget_ms == 0 {
            return Err(ValidationError::config("cycle_budget_ms", "must be non-zero"));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(ValidationError::config(
                "max_backoff_ms",
                "must not be below retry_backoff_ms",
            ));
        }
        Ok(self)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

/// Cooperative cancellation for an in-flight cycle.
///
/// Checked before every sink invocation and during retry backoff.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every clone of this token and wakes pending waits.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|p| p.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleeps up to `timeout`. Returns true if cancelled meanwhile.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

/// Dispatcher phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// No cycle running.
    Idle,
    /// A cycle is offering events to the sink.
    Draining,
    /// The running cycle ended after delivering events.
    Delivered,
    /// The running cycle ended on an event the sink kept rejecting.
    Blocked,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Draining => write!(f, "draining"),
            Self::Delivered => write!(f, "delivered"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Result of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was pending.
    Idle,
    /// No sink registered; events keep accumulating.
    NoSink {
        /// Events waiting for a sink.
        pending: usize,
    },
    /// Another cycle is running.
    Busy,
    /// Events were delivered.
    Delivered {
        /// Events acknowledged this cycle.
        count: usize,
        /// Low-water mark after the cycle.
        low_water_mark: u64,
        /// The batch or time budget ran out with events still pending.
        more: bool,
    },
    /// The sink kept failing on `sequence`; it is retried first next cycle.
    Blocked {
        /// The event that could not be delivered.
        sequence: u64,
        /// Attempts made on it this cycle.
        attempts: u32,
        /// Events acknowledged before it.
        delivered: usize,
    },
    /// The cycle was cancelled at a suspension point.
    Cancelled {
        /// Events acknowledged before cancellation.
        delivered: usize,
    },
    /// The store failed; delivery resumes from the low-water mark.
    Stalled {
        /// Events acknowledged before the failure.
        delivered: usize,
        /// The storage error.
        reason: String,
    },
}

impl CycleOutcome {
    /// Events delivered during the cycle.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        match self {
            Self::Delivered { count, .. } => *count,
            Self::Blocked { delivered, .. }
            | Self::Cancelled { delivered }
            | Self::Stalled { delivered, .. } => *delivered,
            Self::Idle | Self::NoSink { .. } | Self::Busy => 0,
        }
    }

    /// Returns true if pending events remain that another cycle could
    /// deliver right away.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        matches!(self, Self::Delivered { more: true, .. })
    }
}

/// Snapshot of dispatcher progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Current phase.
    pub state: DispatchState,
    /// Whether a notification sink is registered.
    pub sink_registered: bool,
    /// Start of the most recent cycle.
    pub last_cycle_started: Option<DateTime<Utc>>,
    /// End of the most recent cycle.
    pub last_cycle_finished: Option<DateTime<Utc>>,
    /// Cycles that reached the sink.
    pub cycles: u64,
    /// Events acknowledged since startup.
    pub delivered_total: u64,
    /// Failed sink invocations since startup.
    pub failed_attempts_total: u64,
    /// Sequence id the last blocked cycle stopped on.
    pub blocked_on: Option<u64>,
    /// Most recent sink or store error; cleared by the next success.
    pub last_error: Option<String>,
    /// Events not yet acknowledged.
    pub pending: usize,
    /// Highest acknowledged sequence id.
    pub low_water_mark: u64,
}

#[derive(Debug)]
struct Progress {
    state: DispatchState,
    last_cycle_started: Option<DateTime<Utc>>,
    last_cycle_finished: Option<DateTime<Utc>>,
    cycles: u64,
    delivered_total: u64,
    failed_attempts_total: u64,
    blocked_on: Option<u64>,
    last_error: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: DispatchState::Idle,
            last_cycle_started: None,
            last_cycle_finished: None,
            cycles: 0,
            delivered_total: 0,
            failed_attempts_total: 0,
            blocked_on: None,
            last_error: None,
        }
    }
}

enum DeliveryFailure {
    Exhausted { attempts: u32 },
    Cancelled,
}

/// Events fetched from the store per read; the lock is released between reads.
const FETCH_CHUNK: usize = 128;

/// Delivers pending change events to the notification sink.
pub struct SyncDispatcher {
    store: Arc<dyn StateStore>,
    sink: RwLock<Option<Arc<dyn NotificationSink>>>,
    log: Arc<LogEmitter>,
    cfg: DispatchConfig,
    cycle: Mutex<()>,
    progress: Mutex<Progress>,
}

impl fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("cfg", &self.cfg)
            .field("sink_registered", &self.has_sink())
            .finish_non_exhaustive()
    }
}

impl SyncDispatcher {
    /// A dispatcher over `store` with no sink registered.
    pub fn new(store: Arc<dyn StateStore>, log: Arc<LogEmitter>, cfg: DispatchConfig) -> Self {
        Self {
            store,
            sink: RwLock::new(None),
            log,
            cfg,
            cycle: Mutex::new(()),
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Registers (or replaces) the sink. The next cycle backfills every
    /// event accumulated meanwhile.
    pub fn register_sink(&self, sink: Arc<dyn NotificationSink>) {
        let mut slot = self.sink.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(sink);
    }

    /// Removes the sink; later cycles are no-ops until one is registered.
    pub fn clear_sink(&self) {
        let mut slot = self.sink.write().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }

    /// Whether a sink is registered.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.current_sink().is_some()
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.progress
            .lock()
            .map_or(DispatchState::Idle, |p| p.state)
    }

    /// Progress report. Store counters read as zero if the store fails.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let stats = self.store.stats().unwrap_or_default();
        let progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        SyncStatus {
            state: progress.state,
            sink_registered: self.has_sink(),
            last_cycle_started: progress.last_cycle_started,
            last_cycle_finished: progress.last_cycle_finished,
            cycles: progress.cycles,
            delivered_total: progress.delivered_total,
            failed_attempts_total: progress.failed_attempts_total,
            blocked_on: progress.blocked_on,
            last_error: progress.last_error.clone(),
            pending: stats.pending,
            low_water_mark: stats.low_water_mark,
        }
    }

    /// Runs one dispatch cycle.
    ///
    /// Never returns an error: sink and store failures are contained here,
    /// reported through the outcome, the status and the log emitter.
    pub fn run_cycle(&self, cancel: &CancelToken) -> CycleOutcome {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return CycleOutcome::Busy,
        };

        let Some(sink) = self.current_sink() else {
            let pending = self.store.stats().map(|s| s.pending).unwrap_or(0);
            self.log.emit_with(LogLevel::Debug, || {
                format!("sync skipped: no notification sink, {pending} events pending")
            });
            return CycleOutcome::NoSink { pending };
        };

        self.update(|p| {
            p.state = DispatchState::Draining;
            p.last_cycle_started = Some(Utc::now());
            p.cycles += 1;
        });

        let outcome = self.drain(sink.as_ref(), cancel);

        self.update(|p| {
            p.state = match &outcome {
                CycleOutcome::Blocked { .. } => DispatchState::Blocked,
                CycleOutcome::Delivered { .. } => DispatchState::Delivered,
                _ => p.state,
            };
        });
        self.log_outcome(&outcome);
        self.update(|p| {
            p.state = DispatchState::Idle;
            p.last_cycle_finished = Some(Utc::now());
            p.blocked_on = match &outcome {
                CycleOutcome::Blocked { sequence, .. } => Some(*sequence),
                CycleOutcome::Delivered { .. } | CycleOutcome::Idle => None,
                _ => p.blocked_on,
            };
        });

        outcome
    }

    fn drain(&self, sink: &dyn NotificationSink, cancel: &CancelToken) -> CycleOutcome {
        let started = Instant::now();
        let budget = Duration::from_millis(self.cfg.cycle_budget_ms);
        let mut delivered = 0usize;

        loop {
            let low = match self.store.low_water_mark() {
                Ok(low) => low,
                Err(e) => return self.stalled(delivered, &e),
            };

            let want = (self.cfg.batch_size - delivered).min(FETCH_CHUNK);
            let batch = match self.store.list_pending(low, want) {
                Ok(batch) => batch,
                Err(e) => return self.stalled(delivered, &e),
            };

            if batch.is_empty() {
                return if delivered == 0 {
                    CycleOutcome::Idle
                } else {
                    CycleOutcome::Delivered {
                        count: delivered,
                        low_water_mark: low,
                        more: false,
                    }
                };
            }

            for event in batch {
                if cancel.is_cancelled() {
                    return CycleOutcome::Cancelled { delivered };
                }

                match self.deliver(sink, &event, cancel, started, budget) {
                    Ok(()) => {}
                    Err(DeliveryFailure::Cancelled) => return CycleOutcome::Cancelled { delivered },
                    Err(DeliveryFailure::Exhausted { attempts }) => {
                        return CycleOutcome::Blocked {
                            sequence: event.sequence,
                            attempts,
                            delivered,
                        };
                    }
                }

                if let Err(e) = self.store.acknowledge(event.sequence) {
                    self.log.emit_with(LogLevel::Error, || {
                        format!(
                            "delivered event {} for {} but could not acknowledge it: {e}",
                            event.sequence, event.identifier
                        )
                    });
                    return self.stalled(delivered, &e);
                }
                delivered += 1;
                self.update(|p| p.delivered_total += 1);

                if delivered >= self.cfg.batch_size || started.elapsed() >= budget {
                    return self.cut_short(delivered, event.sequence);
                }
            }
        }
    }

    /// Ends a cycle that ran out of batch or time budget.
    fn cut_short(&self, delivered: usize, last_acked: u64) -> CycleOutcome {
        let low_water_mark = self.store.low_water_mark().unwrap_or(last_acked);
        let more = self
            .store
            .list_pending(low_water_mark, 1)
            .map(|b| !b.is_empty())
            .unwrap_or(true);
        CycleOutcome::Delivered {
            count: delivered,
            low_water_mark,
            more,
        }
    }

    /// Offers one event to the sink with bounded retries.
    fn deliver(
        &self,
        sink: &dyn NotificationSink,
        event: &ChangeEvent,
        cancel: &CancelToken,
        started: Instant,
        budget: Duration,
    ) -> Result<(), DeliveryFailure> {
        let buffer = match event.to_buffer() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.record_failure(event, 1, &format!("payload encoding failed: {e}"));
                return Err(DeliveryFailure::Exhausted { attempts: 1 });
            }
        };

        let identifier = event.identifier.as_str();
        for attempt in 1..=self.cfg.max_attempts {
            if cancel.is_cancelled() {
                return Err(DeliveryFailure::Cancelled);
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| sink.notify(identifier, &buffer)));
            let error = match result {
                Ok(Ok(())) => {
                    self.update(|p| p.last_error = None);
                    return Ok(());
                }
                Ok(Err(e)) => e.message,
                Err(_) => "notification sink panicked".to_string(),
            };
            self.record_failure(event, attempt, &error);

            if attempt == self.cfg.max_attempts {
                return Err(DeliveryFailure::Exhausted { attempts: attempt });
            }

            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(DeliveryFailure::Exhausted { attempts: attempt });
            }
            if cancel.wait(self.cfg.backoff(attempt).min(remaining)) {
                return Err(DeliveryFailure::Cancelled);
            }
        }

        Err(DeliveryFailure::Exhausted {
            attempts: self.cfg.max_attempts,
        })
    }

    fn record_failure(&self, event: &ChangeEvent, attempt: u32, error: &str) {
        self.update(|p| {
            p.failed_attempts_total += 1;
            p.last_error = Some(error.to_string());
        });
        self.log.emit_with(LogLevel::Warning, || {
            format!(
                "sync of {} (seq {}) failed on attempt {attempt}/{}: {error}",
                event.identifier, event.sequence, self.cfg.max_attempts
            )
        });
    }

    fn stalled(&self, delivered: usize, error: &StorageError) -> CycleOutcome {
        let reason = error.to_string();
        self.update(|p| p.last_error = Some(reason.clone()));
        CycleOutcome::Stalled { delivered, reason }
    }

    fn log_outcome(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Delivered { count, low_water_mark, more } => {
                self.log.emit_with(LogLevel::Debug, || {
                    format!("sync delivered {count} events, low-water mark {low_water_mark}, more pending: {more}")
                });
            }
            CycleOutcome::Blocked { sequence, attempts, delivered } => {
                self.log.emit_with(LogLevel::Warning, || {
                    format!("sync blocked on seq {sequence} after {attempts} attempts ({delivered} delivered this cycle)")
                });
            }
            CycleOutcome::Cancelled { delivered } => {
                self.log.emit_with(LogLevel::Info, || {
                    format!("sync cycle cancelled after {delivered} events")
                });
            }
            CycleOutcome::Stalled { reason, .. } => {
                self.log.emit_with(LogLevel::Error, || format!("sync stalled: {reason}"));
            }
            CycleOutcome::Idle | CycleOutcome::NoSink { .. } | CycleOutcome::Busy => {}
        }
    }

    fn current_sink(&self) -> Option<Arc<dyn NotificationSink>> {
        self.sink.read().ok().and_then(|s| s.clone())
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut progress);
    }
}
