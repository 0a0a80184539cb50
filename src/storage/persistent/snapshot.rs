//! Compacted snapshots of the state table.
//!
//! A snapshot holds the full table (records, pending events, low-water
//! mark) as of a checkpoint. Recovery loads the newest snapshot and replays
//! the WAL on top of it.
//!
//! # Design
//! - Snapshots are numbered sequentially (snapshot_00001.snap, ...)
//! - Each file holds a header frame followed by one data frame
//! - Files are written to a temp path and renamed into place
//! - Older snapshots are removed once a newer one is durable

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::storage::table::StateTable;

use super::codec;

/// Snapshot file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Highest sequence id covered by this snapshot.
    pub max_sequence: u64,
    /// Low-water mark at the time of the snapshot.
    pub low_water_mark: u64,
    /// Number of records in the snapshot.
    pub record_count: u64,
    /// Number of pending events in the snapshot.
    pub pending_count: u64,
    /// Timestamp when this snapshot was created.
    pub created_at: DateTime<Utc>,
}

/// A snapshot file on disk.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
    id: u32,
    /// Counters recorded when the snapshot was written.
    pub header: SnapshotHeader,
}

impl Snapshot {
    /// Open an existing snapshot and read its header.
    ///
    /// A short or unparsable file is reported as `InvalidData`.
    pub fn open(path: &Path, id: u32) -> IoResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let header: SnapshotHeader = codec::read_header(&mut reader)
            .and_then(|_| codec::decode(&mut reader))
            .map_err(|e| unreadable(path, &e))?;

        Ok(Self {
            path: path.to_path_buf(),
            id,
            header,
        })
    }

    /// Get the path to this snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the table stored in this snapshot.
    pub fn read_table(&self) -> IoResult<StateTable> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        codec::read_header(&mut reader)
            .and_then(|_| codec::decode::<SnapshotHeader>(&mut reader))
            .and_then(|_| codec::decode(&mut reader))
            .map_err(|e| unreadable(&self.path, &e))
    }
}

fn unreadable(path: &Path, e: &IoError) -> IoError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => IoError::new(
            ErrorKind::InvalidData,
            format!("snapshot {} is unreadable: {e}", path.display()),
        ),
        kind => IoError::new(kind, format!("snapshot {}: {e}", path.display())),
    }
}

/// Writes a snapshot atomically: temp file, fsync, rename.
pub struct SnapshotWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    id: u32,
}

impl SnapshotWriter {
    fn new(final_path: PathBuf, id: u32) -> Self {
        let temp_path = final_path.with_extension(format!("snap.tmp.{}", Uuid::new_v4()));
        Self {
            temp_path: Some(temp_path),
            final_path,
            id,
        }
    }

    /// Write `table` and commit the snapshot.
    ///
    /// This is the commit point: after it returns successfully the snapshot
    /// is durable. On error the temp file is removed on drop.
    pub fn write(mut self, table: &StateTable) -> IoResult<Snapshot> {
        let temp_path = self.temp_path.clone().ok_or_else(|| std::io::Error::other("snapshot writer already consumed"))?;

        let header = SnapshotHeader {
            max_sequence: table.max_sequence,
            low_water_mark: table.low_water_mark,
            record_count: table.records.len() as u64,
            pending_count: table.pending.len() as u64,
            created_at: Utc::now(),
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(table)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;
        self.temp_path = None;
        codec::sync_parent_dir(&self.final_path)?;

        Ok(Snapshot {
            path: self.final_path.clone(),
            id: self.id,
            header,
        })
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        // Best-effort cleanup of temp file if not committed
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Manages snapshot files for a database.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    latest: Option<Snapshot>,
    next_id: u32,
}

impl SnapshotManager {
    /// Open or create a snapshot manager for the given directory.
    ///
    /// Loads the header of the newest snapshot and removes stale temp files
    /// and every older snapshot. Older snapshots are never a fallback: the
    /// WAL entries they would need were truncated when the newest was
    /// installed, so an unreadable newest snapshot fails the open.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut found: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.contains(".tmp.") {
                let _ = fs::remove_file(&path);
                continue;
            }

            let id = name
                .strip_prefix("snapshot_")
                .and_then(|rest| rest.strip_suffix(".snap"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(id) = id {
                found.push((id, path));
            }
        }
        found.sort_by_key(|(id, _)| std::cmp::Reverse(*id));

        let next_id = found.first().map_or(1, |(id, _)| id + 1);

        let latest = match found.first() {
            Some((id, path)) => Some(Snapshot::open(path, *id)?),
            None => None,
        };
        for (_, path) in found.iter().skip(1) {
            debug!(path = %path.display(), "removing superseded snapshot");
            let _ = fs::remove_file(path);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            latest,
            next_id,
        })
    }

    /// Get the directory containing snapshots.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The newest snapshot, if any.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// Load the newest snapshot's table, or an empty table.
    pub fn load_latest(&self) -> IoResult<StateTable> {
        match &self.latest {
            Some(snapshot) => snapshot.read_table(),
            None => Ok(StateTable::default()),
        }
    }

    /// Create a writer for the next snapshot.
    pub fn create_writer(&mut self) -> SnapshotWriter {
        let id = self.next_id;
        self.next_id += 1;
        SnapshotWriter::new(self.dir.join(format!("snapshot_{id:05}.snap")), id)
    }

    /// Register a committed snapshot and delete the one it replaces.
    pub fn install(&mut self, snapshot: Snapshot) {
        if let Some(old) = self.latest.replace(snapshot) {
            if self.latest.as_ref().is_some_and(|s| s.id > old.id) {
                let _ = fs::remove_file(old.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_manager_open_empty() {
        let dir = tempdir().unwrap();
        let manager = SnapshotManager::open(dir.path()).unwrap();

        assert!(manager.latest().is_none());
        assert_eq!(manager.load_latest().unwrap(), StateTable::default());
    }

    #[test]
    fn test_snapshot_roundtrip_and_replacement() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path()).unwrap();

        let mut table = StateTable::default();
        table.max_sequence = 10;
        table.low_water_mark = 4;

        let first = manager.create_writer().write(&table).unwrap();
        let first_path = first.path().to_path_buf();
        manager.install(first);

        table.max_sequence = 20;
        let second = manager.create_writer().write(&table).unwrap();
        manager.install(second);

        assert!(!first_path.exists());
        let latest = manager.latest().unwrap();
        assert_eq!(latest.header.max_sequence, 20);
        assert_eq!(latest.header.low_water_mark, 4);

        let reopened = SnapshotManager::open(dir.path()).unwrap();
        assert_eq!(reopened.load_latest().unwrap().max_sequence, 20);
    }

    #[test]
    fn test_stale_temp_files_removed() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("snapshot_00001.snap.tmp.deadbeef");
        fs::write(&stale, b"partial").unwrap();

        let manager = SnapshotManager::open(dir.path()).unwrap();
        assert!(manager.latest().is_none());
        assert!(!stale.exists());
    }

    #[test]
    fn test_unreadable_newest_snapshot_fails_open() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path()).unwrap();

        let mut table = StateTable::default();
        table.max_sequence = 7;
        let first = manager.create_writer().write(&table).unwrap();
        manager.install(first);
        let second = manager.create_writer().write(&table).unwrap();
        let second_path = second.path().to_path_buf();
        manager.install(second);

        let mut bytes = fs::read(&second_path).unwrap();
        bytes.truncate(codec::HEADER_LEN as usize + 3);
        fs::write(&second_path, bytes).unwrap();

        let err = SnapshotManager::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(second_path.exists());
    }

    #[test]
    fn test_dropped_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        let mut manager = SnapshotManager::open(dir.path()).unwrap();
        let writer = manager.create_writer();
        drop(writer);

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
