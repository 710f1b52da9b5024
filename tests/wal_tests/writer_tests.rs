//! Tests for WAL Writer
//!
//! These tests verify:
//! - LSN generation and sequencing
//! - Batched appends and the sync strategy
//! - Reopen continues the LSN sequence
//! - Rewrite replaces the log atomically

use quorumkv::config::WalSyncStrategy;
use quorumkv::wal::{WalReader, WalRecord, WalRecovery, WalWriter};

use crate::common::{entry_record, setup_temp_wal, write_entries};

// =============================================================================
// Basic Writing Tests
// =============================================================================

#[test]
fn test_write_single_record() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    let lsn = writer.append(&entry_record(1, 1, "a")).unwrap();

    assert_eq!(lsn, 1);
    assert_eq!(writer.current_lsn(), 2);
}

#[test]
fn test_append_all_returns_last_lsn() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    let records = vec![
        entry_record(1, 1, "a"),
        entry_record(2, 1, "b"),
        WalRecord::HardState { term: 1, vote: 1, commit: 2 },
    ];
    let last = writer.append_all(&records).unwrap();

    assert_eq!(last, 3);
    assert_eq!(writer.current_lsn(), 4);
}

#[test]
fn test_batched_sync_strategy_still_readable() {
    let (_temp, wal_path) = setup_temp_wal();

    {
        let mut writer =
            WalWriter::open(&wal_path, WalSyncStrategy::EveryNEntries { count: 100 }).unwrap();
        for i in 1..=5 {
            writer.append(&entry_record(i, 1, "x")).unwrap();
        }
    }

    let (records, result) = WalRecovery::recover(&wal_path).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(result.last_lsn, 5);
}

#[test]
fn test_append_all_follows_sync_strategy() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer =
        WalWriter::open(&wal_path, WalSyncStrategy::EveryNEntries { count: 4 }).unwrap();
    writer
        .append_all(&[entry_record(1, 1, "a"), entry_record(2, 1, "b")])
        .unwrap();
    assert_eq!(writer.pending_sync(), 2);

    writer
        .append_all(&[entry_record(3, 1, "c"), entry_record(4, 1, "d")])
        .unwrap();
    assert_eq!(writer.pending_sync(), 0);

    writer.append_all(&[entry_record(5, 1, "e")]).unwrap();
    assert_eq!(writer.pending_sync(), 1);
}

#[test]
fn test_append_all_synced_ignores_strategy() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer =
        WalWriter::open(&wal_path, WalSyncStrategy::EveryNEntries { count: 100 }).unwrap();
    writer.append_all(&[entry_record(1, 1, "a")]).unwrap();
    assert_eq!(writer.pending_sync(), 1);

    writer
        .append_all_synced(&[WalRecord::HardState { term: 1, vote: 1, commit: 1 }])
        .unwrap();
    assert_eq!(writer.pending_sync(), 0);
}

#[test]
fn test_every_write_leaves_nothing_pending() {
    let (_temp, wal_path) = setup_temp_wal();

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    writer
        .append_all(&[entry_record(1, 1, "a"), entry_record(2, 1, "b")])
        .unwrap();
    assert_eq!(writer.pending_sync(), 0);
}

// =============================================================================
// Reopen Tests
// =============================================================================

#[test]
fn test_reopen_continues_lsn_sequence() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 3);

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(writer.current_lsn(), 4);
    assert_eq!(writer.append(&entry_record(4, 1, "d")).unwrap(), 4);

    let mut reader = WalReader::open(&wal_path).unwrap();
    let mut lsns = Vec::new();
    while let Some((lsn, _)) = reader.next_record().unwrap() {
        lsns.push(lsn);
    }
    assert_eq!(lsns, vec![1, 2, 3, 4]);
}

#[test]
fn test_open_refuses_unrecovered_tail() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 2);

    let len = std::fs::metadata(&wal_path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - 3).unwrap();

    assert!(WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).is_err());
}

// =============================================================================
// Rewrite Tests
// =============================================================================

#[test]
fn test_rewrite_replaces_contents() {
    let (_temp, wal_path) = setup_temp_wal();
    write_entries(&wal_path, 10);

    let mut writer = WalWriter::open(&wal_path, WalSyncStrategy::EveryWrite).unwrap();
    let compacted = vec![
        WalRecord::Snapshot { index: 8, term: 1 },
        entry_record(9, 1, "value9"),
        entry_record(10, 1, "value10"),
        WalRecord::HardState { term: 1, vote: 1, commit: 10 },
    ];
    writer.rewrite(&compacted).unwrap();
    assert_eq!(writer.current_lsn(), 5);

    writer.append(&entry_record(11, 2, "value11")).unwrap();
    drop(writer);

    let (records, result) = WalRecovery::recover(&wal_path).unwrap();
    assert_eq!(result.last_lsn, 5);
    assert_eq!(records[0], WalRecord::Snapshot { index: 8, term: 1 });
    assert_eq!(records[4], entry_record(11, 2, "value11"));
    assert!(!wal_path.with_extension("rewrite").exists());
}
