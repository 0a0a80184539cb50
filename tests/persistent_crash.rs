//! Crash recovery tests for the persistent state database.
//!
//! These tests verify that a reopened database:
//! - drops a torn WAL tail and keeps everything before it
//! - refuses to open over a CRC-corrupted entry
//! - never reuses a sequence id and never redelivers an acknowledged event
//! - survives compaction and counter-file loss

#![cfg(feature = "persistent")]

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use fimsync::{
    Attributes, ChangeKind, FimConfig, FimDb, FnNotificationSink, NotifyError, PersistentConfig,
    SequenceConfig, SyncMessage,
};
use tempfile::tempdir;

fn attrs(size: u64) -> Attributes {
    Attributes::file(size, 0o640, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
}

fn open(dir: &Path) -> FimDb {
    FimDb::open(dir, FimConfig::default()).unwrap()
}

fn collecting_sink(db: &FimDb) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    db.register_sink(Arc::new(FnNotificationSink(move |_: &str, buffer: &[u8]| -> Result<(), NotifyError> {
        let msg = SyncMessage::from_buffer(buffer).unwrap();
        s.lock().unwrap().push(msg.sequence);
        Ok(())
    })));
    seen
}

/// A crash mid-append leaves a torn final entry; it is cut, the rest replays.
#[test]
fn test_torn_wal_tail_recovery() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("fim.wal");

    {
        let db = open(dir.path());
        for i in 0..5 {
            db.upsert(&format!("/etc/f{i}"), attrs(i)).unwrap();
        }
    }

    {
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 3).unwrap();
    }

    let db = open(dir.path());
    let stats = db.stats().unwrap();
    assert_eq!(stats.live_records, 4);
    assert_eq!(stats.pending, 4);
    assert!(db.get("/etc/f4").unwrap().is_none());

    // The counter was persisted before seq 5 was handed out, so 5 stays burned.
    db.upsert("/etc/f4", attrs(4)).unwrap();
    let last = db.list_pending(0).unwrap().pop().unwrap();
    assert_eq!(last.sequence, 6);
}

/// Reopening the same database repeatedly yields the same state.
#[test]
fn test_wal_replay_idempotency() {
    let dir = tempdir().unwrap();

    {
        let db = open(dir.path());
        db.upsert("/etc/passwd", attrs(1)).unwrap();
        db.upsert("/etc/passwd", attrs(2)).unwrap();
    }

    for _ in 0..2 {
        let db = open(dir.path());
        let record = db.get("/etc/passwd").unwrap().unwrap();
        assert_eq!(record.attributes.size, 2);
        assert_eq!(record.last_sequence, 2);
        assert_eq!(db.list_pending(0).unwrap().len(), 2);
    }
}

/// A flipped bit inside a complete entry is reported, not skipped.
#[test]
fn test_crc_corruption_detection() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("fim.wal");

    {
        let db = open(dir.path());
        db.upsert("/etc/crc-a", attrs(1)).unwrap();
        db.upsert("/etc/crc-b", attrs(2)).unwrap();
    }

    {
        let mut content = Vec::new();
        fs::File::open(&wal_path).unwrap().read_to_end(&mut content).unwrap();

        // Header (5) + frame version (1) + frame length (4), then JSON body.
        let idx = 5 + 1 + 4 + 8;
        content[idx] ^= 0xFF;

        fs::File::create(&wal_path).unwrap().write_all(&content).unwrap();
    }

    let err = FimDb::open(dir.path(), FimConfig::default()).unwrap_err();
    assert!(err.is_storage());
    assert!(!err.is_retryable());
    let msg = err.to_string();
    assert!(msg.contains("CRC") || msg.contains("corrupt"), "unexpected error: {msg}");
}

/// A damaged snapshot fails the open instead of yielding an empty database.
#[test]
fn test_corrupted_snapshot_header_fails_open() {
    let dir = tempdir().unwrap();

    {
        let db = open(dir.path());
        for i in 0..5 {
            db.upsert(&format!("/etc/f{i}"), attrs(i)).unwrap();
        }
        assert!(db.compact().unwrap().is_some());
        db.upsert("/etc/f5", attrs(5)).unwrap();
    }

    let snapshot = fs::read_dir(dir.path().join("snapshots"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|ext| ext == "snap"))
        .unwrap();
    let mut content = fs::read(&snapshot).unwrap();
    // File header (5) + frame version (1) + frame length (4), then header JSON.
    content[5 + 1 + 4 + 2] ^= 0xFF;
    fs::write(&snapshot, content).unwrap();

    let err = FimDb::open(dir.path(), FimConfig::default()).unwrap_err();
    assert!(err.is_storage());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("snapshot"), "unexpected error: {err}");
    assert!(snapshot.exists());
}

/// Acknowledged events are never redelivered; unacknowledged ones are.
#[test]
fn test_no_redelivery_after_restart() {
    let dir = tempdir().unwrap();

    {
        let db = open(dir.path());
        for i in 0..3 {
            db.upsert(&format!("/srv/a{i}"), attrs(i)).unwrap();
        }
        let seen = collecting_sink(&db);
        assert_eq!(db.run_sync().delivered(), 3);
        assert_eq!(*seen.lock().unwrap(), [1, 2, 3]);

        db.upsert("/srv/late", attrs(9)).unwrap();
        db.mark_deleted("/srv/a0").unwrap();
    }

    let db = open(dir.path());
    assert_eq!(db.status().low_water_mark, 3);

    let seen = collecting_sink(&db);
    db.run_sync();
    assert_eq!(*seen.lock().unwrap(), [4, 5]);

    // The acknowledged deletion purged its tombstone.
    assert!(db.get("/srv/a0").unwrap().is_none());
}

/// Ids handed out after a restart exceed every id handed out before it.
#[test]
fn test_sequence_never_reused() {
    let dir = tempdir().unwrap();
    let config = FimConfig {
        sequence: SequenceConfig { reserve_block: 10 },
        ..FimConfig::default()
    };

    {
        let db = FimDb::open(dir.path(), config.clone()).unwrap();
        for i in 0..3 {
            db.upsert(&format!("/bin/b{i}"), attrs(i)).unwrap();
        }
        assert_eq!(db.current_sequence(), 3);
    }

    let db = FimDb::open(dir.path(), config).unwrap();
    assert_eq!(db.upsert("/bin/b0", attrs(100)).unwrap(), Some(ChangeKind::Modified));
    let last = db.list_pending(3).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].sequence, 11);
}

/// Losing the counter file falls back to the store's highest sequence.
#[test]
fn test_counter_file_loss() {
    let dir = tempdir().unwrap();

    {
        let db = open(dir.path());
        db.upsert("/opt/x", attrs(1)).unwrap();
        db.upsert("/opt/y", attrs(1)).unwrap();
    }
    fs::remove_file(dir.path().join("sequence.ctr")).unwrap();

    let db = open(dir.path());
    assert_eq!(db.current_sequence(), 2);
    db.upsert("/opt/z", attrs(1)).unwrap();
    assert_eq!(db.list_pending(2).unwrap()[0].sequence, 3);
}

/// Automatic compaction, on by default, keeps the WAL bounded without losing state.
#[test]
fn test_auto_compaction_recovery() {
    let dir = tempdir().unwrap();
    let config = FimConfig {
        persistent: PersistentConfig {
            max_wal_size: 4096,
            sync_on_write: false,
        },
        ..FimConfig::default()
    };

    {
        let db = FimDb::open(dir.path(), config.clone()).unwrap();
        for i in 0..100 {
            db.upsert(&format!("/var/lib/pkg/{i:03}"), attrs(i)).unwrap();
        }
        let seen = collecting_sink(&db);
        db.run_sync();
        assert_eq!(seen.lock().unwrap().len(), 100);
        for i in 0..10 {
            db.upsert(&format!("/var/lib/pkg/{i:03}"), attrs(i + 1000)).unwrap();
        }
    }

    assert!(dir.path().join("snapshots").read_dir().unwrap().count() >= 1);
    assert!(fs::metadata(dir.path().join("fim.wal")).unwrap().len() <= 2 * 4096);

    let db = FimDb::open(dir.path(), config).unwrap();
    let stats = db.stats().unwrap();
    assert_eq!(stats.live_records, 100);
    assert_eq!(stats.pending, 10);
    assert_eq!(stats.low_water_mark, 100);
    assert_eq!(db.get("/var/lib/pkg/005").unwrap().unwrap().attributes.size, 1005);
}

/// A second process (or handle) cannot open a database in use.
#[test]
fn test_exclusive_open() {
    let dir = tempdir().unwrap();
    let _db = open(dir.path());

    let err = FimDb::open(dir.path(), FimConfig::default()).unwrap_err();
    assert!(err.is_storage());
    assert!(err.to_string().contains("locked by"));
}
