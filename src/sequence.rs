//! Monotonic sequence allocation.
//!
//! Every change gets a unique, strictly increasing sequence id. The
//! allocator persists its high mark before handing an id out, so after a
//! restart it resumes strictly above anything it may have issued. Ids can
//! be skipped across a crash but are never reused.

use std::fmt;
use std::io;
use std::sync::Mutex;

use thiserror::Error;

/// Errors raised while allocating a sequence id.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// The high mark could not be made durable.
    #[error("failed to persist sequence counter: {0}")]
    Persist(#[source] io::Error),

    /// The persisted counter could not be read back.
    #[error("failed to load sequence counter: {0}")]
    Load(#[source] io::Error),

    /// The 64-bit space is used up.
    #[error("sequence space exhausted")]
    Exhausted,

    /// A thread panicked while holding the allocator lock.
    #[error("poisoned lock: {0}")]
    LockPoisoned(&'static str),
}

/// Durable home of the allocator's high mark.
pub trait CounterStore: Send + Sync {
    /// Returns the last persisted high mark, or `None` for a fresh store.
    fn load(&self) -> io::Result<Option<u64>>;

    /// Durably records `high_mark`. Must not return before the value would
    /// survive a crash.
    fn persist(&self, high_mark: u64) -> io::Result<()>;
}

/// Volatile counter store for embedded use and tests.
#[derive(Debug, Default)]
pub struct MemoryCounter {
    value: Mutex<Option<u64>>,
}

impl MemoryCounter {
    /// A store that starts at `value`, as if restarted after persisting it.
    #[must_use]
    pub fn starting_at(value: u64) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }
}

impl CounterStore for MemoryCounter {
    fn load(&self) -> io::Result<Option<u64>> {
        self.value
            .lock()
            .map(|v| *v)
            .map_err(|_| io::Error::other("poisoned lock: memory_counter"))
    }

    fn persist(&self, high_mark: u64) -> io::Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| io::Error::other("poisoned lock: memory_counter"))?;
        *value = Some(high_mark);
        Ok(())
    }
}

#[derive(Debug)]
struct AllocatorState {
    /// Last id handed out.
    issued: u64,
    /// Highest id covered by the persisted high mark.
    reserved: u64,
}

/// Process-wide monotonic sequence allocator.
///
/// Shared by handle (`Arc`) between the detector and anything else that
/// needs ids; never a global.
pub struct SequenceAllocator {
    store: Box<dyn CounterStore>,
    state: Mutex<AllocatorState>,
    block: u64,
}

impl fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("block", &self.block)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SequenceAllocator {
    /// Opens an allocator over `store`, persisting one id at a time.
    ///
    /// # Errors
    /// Returns `Load` if the stored high mark cannot be read.
    pub fn open(store: Box<dyn CounterStore>) -> Result<Self, SequenceError> {
        Self::with_block(store, 1)
    }

    /// Opens an allocator that reserves `block` ids per persisted write.
    ///
    /// Larger blocks trade id gaps after a crash for fewer fsyncs.
    ///
    /// # Errors
    /// Returns `Load` if the stored high mark cannot be read.
    pub fn with_block(store: Box<dyn CounterStore>, block: u64) -> Result<Self, SequenceError> {
        let persisted = store.load().map_err(SequenceError::Load)?.unwrap_or(0);
        Ok(Self {
            store,
            // Anything up to the persisted mark may already be in use.
            state: Mutex::new(AllocatorState {
                issued: persisted,
                reserved: persisted,
            }),
            block: block.max(1),
        })
    }

    /// A volatile allocator starting at 1.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryCounter::default()),
            state: Mutex::new(AllocatorState {
                issued: 0,
                reserved: 0,
            }),
            block: 1,
        }
    }

    /// Allocates the next id.
    ///
    /// # Errors
    /// `Persist` if the high mark cannot be made durable; no id is handed
    /// out in that case.
    pub fn next(&self) -> Result<u64, SequenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SequenceError::LockPoisoned("sequence.next"))?;
        self.advance(&mut state)
    }

    /// Allocates the next id and runs `commit` with it while the allocator
    /// stays locked, so commits land in the same order as their ids.
    ///
    /// If `commit` fails the id is burned; it is never handed out again.
    ///
    /// # Errors
    /// Allocation errors converted into `E`, or whatever `commit` returns.
    pub fn allocate_with<T, E, F>(&self, commit: F) -> Result<T, E>
    where
        E: From<SequenceError>,
        F: FnOnce(u64) -> Result<T, E>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SequenceError::LockPoisoned("sequence.allocate_with"))?;
        let sequence = self.advance(&mut state)?;
        commit(sequence)
    }

    /// Ensures the next id is greater than `floor`.
    ///
    /// Called after recovery with the highest sequence the store has seen,
    /// which covers a counter file lost or rolled back independently of the
    /// log.
    ///
    /// # Errors
    /// `LockPoisoned` only.
    pub fn resume_above(&self, floor: u64) -> Result<(), SequenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SequenceError::LockPoisoned("sequence.resume_above"))?;
        if floor > state.issued {
            state.issued = floor;
        }
        Ok(())
    }

    /// The last id handed out (0 if none).
    #[must_use]
    pub fn current(&self) -> u64 {
        self.state.lock().map(|s| s.issued).unwrap_or(0)
    }

    fn advance(&self, state: &mut AllocatorState) -> Result<u64, SequenceError> {
        let candidate = state.issued.checked_add(1).ok_or(SequenceError::Exhausted)?;

        if candidate > state.reserved {
            let high_mark = candidate.saturating_add(self.block - 1);
            self.store.persist(high_mark).map_err(SequenceError::Persist)?;
            state.reserved = high_mark;
        }

        state.issued = candidate;
        Ok(candidate)
    }
}

#[cfg(feature = "persistent")]
pub use file_counter::FileCounter;

#[cfg(feature = "persistent")]
mod file_counter {
    use std::fs::{self, OpenOptions};
    use std::io::{self, BufReader, Write};
    use std::path::{Path, PathBuf};

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::CounterStore;
    use crate::storage::persistent::codec;

    #[derive(Debug, Serialize, Deserialize)]
    struct CounterRecord {
        high_mark: u64,
        written_at: DateTime<Utc>,
    }

    /// Counter persisted to a single file via write-temp-then-rename.
    #[derive(Debug, Clone)]
    pub struct FileCounter {
        path: PathBuf,
    }

    impl FileCounter {
        /// A counter stored at `path`. The file is created on first persist.
        #[must_use]
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Location of the counter file.
        #[must_use]
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl CounterStore for FileCounter {
        fn load(&self) -> io::Result<Option<u64>> {
            let file = match fs::File::open(&self.path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            let mut reader = BufReader::new(file);
            codec::read_header(&mut reader)?;
            let record: CounterRecord = codec::decode(&mut reader)?;
            Ok(Some(record.high_mark))
        }

        fn persist(&self, high_mark: u64) -> io::Result<()> {
            let temp_path = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
            let record = CounterRecord {
                high_mark,
                written_at: Utc::now(),
            };

            let result = (|| {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&temp_path)?;
                codec::write_header(&mut file)?;
                file.write_all(&codec::encode(&record)?)?;
                file.sync_all()?;
                fs::rename(&temp_path, &self.path)?;
                codec::sync_parent_dir(&self.path)
            })();

            if result.is_err() {
                let _ = fs::remove_file(&temp_path);
            }
            result
        }
    }
}
