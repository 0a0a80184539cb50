//! Diagnostic log delivery to a host-provided sink.
//!
//! The emitter is fire-and-forget: a missing sink turns every call into a
//! no-op, sink errors are discarded and sink panics are caught at the call
//! boundary. Nothing the sink does can reach the synchronization path.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Per-cycle progress.
    Debug,
    /// Lifecycle events such as scans and cancellations.
    Info,
    /// Retried or recoverable failures.
    Warning,
    /// Failures that stop a cycle.
    Error,
    /// Failures that leave the database unusable.
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Failure reported by a log sink. Always discarded by the emitter.
#[derive(Debug, Error)]
#[error("log sink failed: {message}")]
pub struct LogSinkError {
    /// Why the record was not taken.
    pub message: String,
}

impl LogSinkError {
    /// Creates an error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Destination for diagnostic messages.
///
/// Implementations must not call back into the state store.
pub trait LogSink: Send + Sync {
    /// Delivers one record.
    fn log(&self, level: LogLevel, message: &str) -> Result<(), LogSinkError>;
}

/// Adapts an infallible closure into a [`LogSink`].
pub struct FnLogSink<F>(pub F);

impl<F> LogSink for FnLogSink<F>
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) -> Result<(), LogSinkError> {
        (self.0)(level, message);
        Ok(())
    }
}

/// Forwards records to `tracing` under the `fimsync` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str) -> Result<(), LogSinkError> {
        match level {
            LogLevel::Debug => tracing::debug!(target: "fimsync", "{message}"),
            LogLevel::Info => tracing::info!(target: "fimsync", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "fimsync", "{message}"),
            LogLevel::Error => tracing::error!(target: "fimsync", "{message}"),
            LogLevel::Critical => tracing::error!(target: "fimsync", critical = true, "{message}"),
        }
        Ok(())
    }
}

/// Emits diagnostics to an optional, replaceable sink.
pub struct LogEmitter {
    sink: RwLock<Option<Arc<dyn LogSink>>>,
    min_level: LogLevel,
    dropped: AtomicU64,
}

impl fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEmitter")
            .field("has_sink", &self.has_sink())
            .field("min_level", &self.min_level)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Default for LogEmitter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl LogEmitter {
    /// An emitter with no sink; every call is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: RwLock::new(None),
            min_level: LogLevel::Debug,
            dropped: AtomicU64::new(0),
        }
    }

    /// An emitter delivering to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        let emitter = Self::disabled();
        emitter.set_sink(Some(sink));
        emitter
    }

    /// Convenience constructor for closure sinks.
    #[must_use]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnLogSink(f)))
    }

    /// Records below `level` are filtered out before reaching the sink.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Replaces (or removes) the sink.
    pub fn set_sink(&self, sink: Option<Arc<dyn LogSink>>) {
        // A poisoned slot is still a valid Option; recover it.
        let mut slot = self.sink.write().unwrap_or_else(|p| p.into_inner());
        *slot = sink;
    }

    /// Whether a sink is installed.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Returns true if a record at `level` would reach a sink.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level && self.has_sink()
    }

    /// Number of records the sink rejected or panicked on.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Delivers a record. Never fails and never panics.
    pub fn emit(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }

        let sink = match self.sink.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(sink) = sink else {
            return;
        };

        let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.log(level, message)));
        if !matches!(delivered, Ok(Ok(()))) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Like [`emit`](Self::emit) but only builds the message when a sink
    /// would receive it.
    pub fn emit_with(&self, level: LogLevel, message: impl FnOnce() -> String) {
        if self.enabled(level) {
            self.emit(level, &message());
        }
    }

    /// Emits at [`LogLevel::Debug`].
    pub fn debug(&self, message: &str) {
        self.emit(LogLevel::Debug, message);
    }

    /// Emits at [`LogLevel::Info`].
    pub fn info(&self, message: &str) {
        self.emit(LogLevel::Info, message);
    }

    /// Emits at [`LogLevel::Warning`].
    pub fn warning(&self, message: &str) {
        self.emit(LogLevel::Warning, message);
    }

    /// Emits at [`LogLevel::Error`].
    pub fn error(&self, message: &str) {
        self.emit(LogLevel::Error, message);
    }

    /// Emits at [`LogLevel::Critical`].
    pub fn critical(&self, message: &str) {
        self.emit(LogLevel::Critical, message);
    }
}
