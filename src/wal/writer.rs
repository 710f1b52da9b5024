//! WAL Writer
//!
//! Handles appending records to the WAL file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::{QuorumError, Result};

use super::{WalRecord, WalRecovery};

/// Writes records to the WAL file
pub struct WalWriter {
    /// Path of the log file (needed for rewrite)
    path: PathBuf,

    /// Buffered append handle
    writer: BufWriter<File>,

    /// LSN assigned to the next appended record
    next_lsn: u64,

    /// How often appends reach the disk
    sync_strategy: WalSyncStrategy,

    /// Records written since the last fsync
    unsynced: usize,
}

impl WalWriter {
    /// Open or create a WAL file
    ///
    /// An existing file is scanned so new records continue its LSN sequence.
    /// Callers are expected to have run recovery first; a torn tail here is
    /// reported as corruption rather than silently overwritten.
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let last_lsn = if path.exists() {
            let result = WalRecovery::verify(path)?;
            if result.entries_corrupted > 0 {
                return Err(QuorumError::WalCorruption(format!(
                    "{} has an unrecovered tail after lsn {}",
                    path.display(),
                    result.last_lsn
                )));
            }
            result.last_lsn
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_lsn: last_lsn + 1,
            sync_strategy,
            unsynced: 0,
        })
    }

    /// Append a record, honouring the sync strategy. Returns its LSN.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let lsn = self.write_frame(record)?;
        self.unsynced += 1;
        self.maybe_sync()?;
        Ok(lsn)
    }

    /// Append several records, honouring the sync strategy once at the end
    pub fn append_all(&mut self, records: &[WalRecord]) -> Result<u64> {
        let last = self.write_all(records)?;
        self.maybe_sync()?;
        Ok(last)
    }

    /// Append several records and fsync regardless of the strategy
    pub fn append_all_synced(&mut self, records: &[WalRecord]) -> Result<u64> {
        let last = self.write_all(records)?;
        self.sync()?;
        Ok(last)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Records written since the last fsync
    pub fn pending_sync(&self) -> usize {
        self.unsynced
    }

    /// Get the LSN the next record will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Replace the whole log with `records`
    ///
    /// Writes a sibling temp file, fsyncs it, then renames it over the log so
    /// a crash leaves either the old or the new file intact. LSNs restart at 1.
    pub fn rewrite(&mut self, records: &[WalRecord]) -> Result<()> {
        self.writer.flush()?;

        let temp_path = self.path.with_extension("rewrite");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut temp = BufWriter::new(file);
            for (i, record) in records.iter().enumerate() {
                temp.write_all(&record.encode(i as u64 + 1)?)?;
            }
            temp.flush()?;
            temp.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_lsn = records.len() as u64 + 1;
        self.unsynced = 0;
        Ok(())
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&mut self, records: &[WalRecord]) -> Result<u64> {
        let mut last = self.next_lsn.saturating_sub(1);
        for record in records {
            last = self.write_frame(record)?;
        }
        self.unsynced += records.len();
        Ok(last)
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_strategy {
            WalSyncStrategy::EveryWrite => self.sync(),
            WalSyncStrategy::EveryNEntries { count } if self.unsynced >= count => self.sync(),
            WalSyncStrategy::EveryNEntries { .. } => {
                self.writer.flush()?;
                Ok(())
            }
        }
    }

    fn write_frame(&mut self, record: &WalRecord) -> Result<u64> {
        let lsn = self.next_lsn;
        let frame = record.encode(lsn)?;
        self.writer
            .write_all(&frame)
            .map_err(|e| QuorumError::WalWrite(format!("lsn {}: {}", lsn, e)))?;
        self.next_lsn += 1;
        Ok(lsn)
    }
}
