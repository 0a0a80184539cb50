//! Persistent storage backend for fimsync.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process ownership
//! - CRC32 checksums for corruption detection
//! - Snapshots for bounded recovery time
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   .lock            exclusive lock (holder pid)
//!   fim.wal          commits and acknowledgements since the last snapshot
//!   sequence.ctr     sequence allocator high mark
//!   snapshots/       snapshot_NNNNN.snap
//! ```

pub(crate) mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use snapshot::{Snapshot, SnapshotHeader, SnapshotManager};
pub use store::PersistentStateStore;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::Deserialize;

use crate::error::ValidationError;
use crate::storage::StorageError;

/// Name of the sequence counter file inside a database directory.
pub const SEQUENCE_FILE: &str = "sequence.ctr";

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 16 * 1024 * 1024, // 16 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::config(
                "max_wal_size",
                format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            ));
        }
        Ok(self)
    }
}

/// Open or create a persistent state store at the given path.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If the WAL or snapshot is corrupted
///
/// # Example
/// ```rust,no_run
/// use fimsync::storage::open_store;
///
/// let store = open_store("/var/ossec/queue/fim/db", None)?;
/// # Ok::<(), fimsync::StorageError>(())
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentStateStore, StorageError> {
    let cfg = config
        .unwrap_or_default()
        .validate()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    PersistentStateStore::open(path.as_ref(), cfg)
}
