//! State store: the entity table and the pending-change log.
//!
//! [`StateStore`] defines the contract; [`MemoryStateStore`] is the volatile
//! backend and, with the `persistent` feature, [`persistent`] provides the
//! durable one.

mod memory;
pub(crate) mod table;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::MemoryStateStore;
pub use traits::{AckOutcome, CompactionResult, StateStore, StorageError, StoreStats};

#[cfg(feature = "persistent")]
pub use persistent::{open_store, PersistentConfig, PersistentStateStore};
