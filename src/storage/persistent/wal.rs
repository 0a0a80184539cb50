//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Every commit and acknowledgement is appended (and fsynced when
//! `sync_on_write` is set) before it is applied to the in-memory table.
//! Replaying the log on startup restores the table.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```
//!
//! A crash mid-append leaves a torn final frame. `open` cuts the file back
//! to the last complete frame so later appends never follow garbage.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::change::ChangeCommit;

use super::codec;

fn poisoned(context: &str) -> std::io::Error {
    std::io::Error::other(format!("poisoned lock: {context}"))
}

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Position of this entry in the log, starting at 1 after each truncation.
    pub position: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The operation being logged.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A record update together with its change event.
    Commit(ChangeCommit),
    /// A change event was delivered and acknowledged.
    Ack {
        /// The acknowledged sequence id.
        sequence: u64,
    },
    /// Everything up to `max_sequence` is contained in a snapshot.
    Checkpoint {
        /// Highest sequence id in the snapshot.
        max_sequence: u64,
    },
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
    #[cfg(test)]
    fail_next_append: std::sync::atomic::AtomicBool,
}

struct WalState {
    /// `None` after a failed append could not be rolled back.
    writer: Option<BufWriter<File>>,
    position: u64,
    wedged: Option<String>,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// If the file exists, finds the last complete entry and truncates any
    /// torn tail after it. If it doesn't exist, creates it with the header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let exists = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let position = if exists && file.metadata()?.len() >= codec::HEADER_LEN {
            let (last_position, valid_len) = Self::scan_valid_prefix(path)?;
            let len = file.metadata()?.len();
            if valid_len < len {
                warn!(
                    path = %path.display(),
                    discarded = len - valid_len,
                    "WAL: truncating torn tail after position {last_position}"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last_position
        } else {
            let mut file = file;
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: Some(BufWriter::new(file)),
                position,
                wedged: None,
            }),
            sync_on_write,
            #[cfg(test)]
            fail_next_append: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the position assigned to this entry. On error the file is cut
    /// back to its length before the call, so a failed entry never reaches
    /// a later replay. If that cut fails too, every further append fails.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.state.lock().map_err(|_| poisoned("wal.state"))?;
        let state = &mut *state;
        let Some(writer) = state.writer.as_mut() else {
            let reason = state.wedged.as_deref().unwrap_or("unknown");
            return Err(std::io::Error::other(format!(
                "WAL: appends disabled after failed rollback: {reason}"
            )));
        };

        let candidate = state.position + 1;
        let entry = WalEntry {
            position: candidate,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        // Every successful append flushes, so the buffer is empty here.
        let start_len = writer.get_ref().metadata()?.len();

        if let Err(e) = self.write_frame(writer, &encoded) {
            self.roll_back(state, start_len, &e);
            return Err(e);
        }

        state.position = candidate;
        Ok(candidate)
    }

    fn write_frame(&self, writer: &mut BufWriter<File>, encoded: &[u8]) -> IoResult<()> {
        #[cfg(test)]
        if self
            .fail_next_append
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            // Half the frame reaches the file, the rest stays buffered.
            let half = encoded.len() / 2;
            writer.write_all(&encoded[..half])?;
            writer.flush()?;
            writer.write_all(&encoded[half..])?;
            return Err(std::io::Error::other("injected write failure"));
        }

        writer.write_all(encoded)?;
        writer.flush()?;
        if self.sync_on_write {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Discards buffered bytes of a failed append and cuts the file back
    /// to `len`.
    fn roll_back(&self, state: &mut WalState, len: u64, cause: &std::io::Error) {
        let Some(writer) = state.writer.take() else {
            return;
        };
        // `into_parts` hands back the file without flushing the buffer.
        let (file, _unflushed) = writer.into_parts();

        match file.set_len(len).and_then(|()| file.sync_all()) {
            Ok(()) => {
                warn!(path = %self.path.display(), len, "WAL: rolled back failed append: {cause}");
                state.writer = Some(BufWriter::new(file));
            }
            Err(e) => {
                error!(path = %self.path.display(), "WAL: rollback after failed append failed: {e}");
                state.wedged = Some(format!("{cause}; rollback: {e}"));
            }
        }
    }

    /// Makes the next append fail after writing part of its frame.
    #[cfg(test)]
    pub(crate) fn inject_append_failure(&self) {
        self.fail_next_append
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay mutations.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Position of the last appended entry.
    pub fn position(&self) -> u64 {
        self.state.lock().map(|s| s.position).unwrap_or(0)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Truncate the WAL after a checkpoint (compaction).
    ///
    /// Only call this after the snapshot covering every entry is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned("wal.state"))?;
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }

        {
            let mut file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = Some(BufWriter::new(file));
        state.position = 0;
        state.wedged = None;

        debug!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Returns (last valid position, byte length of the valid prefix).
    ///
    /// A torn final frame ends the scan; a complete frame that fails its
    /// CRC is corruption and is returned as an error.
    fn scan_valid_prefix(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_position = 0;
        let mut valid_len = iter.offset()?;

        loop {
            match iter.next_entry() {
                Ok(Some(entry)) => {
                    last_position = entry.position;
                    valid_len = iter.offset()?;
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(std::io::Error::new(
                        e.kind(),
                        format!("WAL: corruption after position {last_position}: {e}"),
                    ));
                }
            }
        }

        Ok((last_position, valid_len))
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn offset(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn next_entry(&mut self) -> IoResult<Option<WalEntry>> {
        if self.offset()? >= self.file_size {
            return Ok(None);
        }
        codec::decode(&mut self.reader).map(Some)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    /// Stops silently at a torn tail; corruption is yielded as an error.
    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
