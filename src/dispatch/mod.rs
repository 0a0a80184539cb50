//! Synchronization of pending change events to a consumer.

/// Cycle logic and the notification sink contract.
pub mod dispatcher;
/// Background thread driving dispatch cycles.
pub mod worker;

pub use dispatcher::{
    CancelToken, CycleOutcome, DispatchConfig, DispatchState, FnNotificationSink,
    NotificationSink, NotifyError, SyncDispatcher, SyncStatus,
};
pub use worker::{SyncWorker, WorkerConfig};
