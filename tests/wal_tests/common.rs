//! Shared helpers for WAL tests

use std::path::PathBuf;

use quorumkv::config::WalSyncStrategy;
use quorumkv::wal::{EntryKind, LogRecord, WalRecord, WalWriter};
use tempfile::TempDir;

pub fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal.log");
    (temp_dir, wal_path)
}

pub fn entry_record(index: u64, term: u64, data: &str) -> WalRecord {
    WalRecord::Entry(LogRecord {
        index,
        term,
        kind: EntryKind::Normal,
        data: data.as_bytes().to_vec(),
        context: Vec::new(),
    })
}

/// Write `count` entry records through the writer (well-formed WAL)
pub fn write_entries(path: &PathBuf, count: u64) {
    let mut writer = WalWriter::open(path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 1..=count {
        writer.append(&entry_record(i, 1, &format!("value{}", i))).unwrap();
    }
}
