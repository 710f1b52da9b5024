//! WAL Recovery
//!
//! Handles crash recovery by replaying the WAL.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{QuorumError, Result};

use super::{WalReader, WalRecord};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of records successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted records skipped (0 or 1: scanning stops at the first)
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the WAL was truncated (partial writes removed)
    pub was_truncated: bool,
}

impl WalRecovery {
    /// Recover records from a WAL file
    ///
    /// This will:
    /// 1. Read all valid records
    /// 2. Stop at the first torn or corrupted record
    /// 3. Truncate the file back to the last valid record
    /// 4. Return all valid records in order
    pub fn recover(path: &Path) -> Result<(Vec<WalRecord>, RecoveryResult)> {
        let (records, mut result, valid_len) = Self::scan(path)?;

        if result.entries_corrupted > 0 {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            result.was_truncated = true;
            tracing::warn!(
                path = %path.display(),
                last_lsn = result.last_lsn,
                "truncated torn WAL tail"
            );
        }

        Ok((records, result))
    }

    /// Verify integrity of a WAL file without modifying it
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, result, _) = Self::scan(path)?;
        Ok(result)
    }

    fn scan(path: &Path) -> Result<(Vec<WalRecord>, RecoveryResult, u64)> {
        let mut reader = WalReader::open(path)?;
        let mut records = Vec::new();
        let mut corrupted = 0;

        loop {
            match reader.next_record() {
                Ok(Some((_, record))) => records.push(record),
                Ok(None) => break,
                Err(QuorumError::WalCorruption(reason)) => {
                    tracing::debug!(path = %path.display(), %reason, "WAL scan stopped");
                    corrupted = 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let result = RecoveryResult {
            entries_recovered: records.len() as u64,
            entries_corrupted: corrupted,
            last_lsn: reader.last_lsn(),
            was_truncated: false,
        };
        Ok((records, result, reader.valid_len()))
    }
}
