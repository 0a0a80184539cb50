//! # fimsync - Change synchronization for file integrity monitoring
//!
//! fimsync keeps the state database of a file integrity monitor: the last
//! known attributes of every monitored file or registry entry, and an
//! ordered log of the changes detected since a consumer last caught up.
//!
//! ## Core Concepts
//!
//! - **State Store**: entity records plus the pending-change log, in memory
//!   or persisted behind a write-ahead log
//! - **Change Detector**: classifies observations into created / modified /
//!   deleted and commits them under monotonically increasing sequence ids
//! - **Sync Dispatcher**: delivers pending events to a notification sink in
//!   sequence order and acknowledges them only after success
//! - **Log Emitter**: fire-and-forget diagnostics to a host-provided sink
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use fimsync::{Attributes, FimConfig, FimDb, FnNotificationSink, NotifyError, TracingLogSink};
//!
//! let db = FimDb::open("/var/lib/fim/db", FimConfig::default())?;
//! db.set_log_sink(Some(Arc::new(TracingLogSink)));
//! db.register_sink(Arc::new(FnNotificationSink(|id: &str, buffer: &[u8]| -> Result<(), NotifyError> {
//!     println!("{id}: {} bytes", buffer.len());
//!     Ok(())
//! })));
//!
//! db.upsert("/etc/passwd", Attributes::file(2048, 0o644, Utc::now()))?;
//! db.run_sync();
//! # Ok::<(), fimsync::FimError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod change;
pub mod entity;
pub mod error;

// Engine
pub mod config;
pub mod db;
pub mod detector;
pub mod dispatch;
pub mod logging;
pub mod sequence;
pub mod storage;

pub use change::{ChangeCommit, ChangeEvent, ChangeKind, SyncMessage};
pub use config::{FimConfig, SequenceConfig};
pub use db::{FimDb, IntegrityChecksum};
pub use detector::{ChangeDetector, DetectorConfig, Observation};
pub use dispatch::{
    CancelToken, CycleOutcome, DispatchConfig, DispatchState, FnNotificationSink,
    NotificationSink, SyncDispatcher, SyncStatus, SyncWorker, WorkerConfig,
};
pub use entity::{Attributes, CompareSet, ContentHash, EntityId, EntityKind, EntityRecord};
pub use error::{FimError, FimResult, NotifyError, ValidationError};
pub use logging::{FnLogSink, LogEmitter, LogLevel, LogSink, LogSinkError, TracingLogSink};
pub use sequence::{CounterStore, MemoryCounter, SequenceAllocator, SequenceError};
pub use storage::{MemoryStateStore, StateStore, StorageError};

#[cfg(feature = "persistent")]
pub use sequence::FileCounter;
#[cfg(feature = "persistent")]
pub use storage::{PersistentConfig, PersistentStateStore};
