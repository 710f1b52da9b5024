//! WAL Reader
//!
//! Handles reading records from the WAL file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{QuorumError, Result};

use super::entry::FrameHeader;
use super::{WalRecord, HEADER_SIZE, MAX_RECORD_SIZE};

/// Reads records from the WAL file
pub struct WalReader {
    reader: BufReader<File>,

    /// Byte offset just past the last record that decoded cleanly
    valid_len: u64,

    /// LSN of the last record that decoded cleanly
    last_lsn: u64,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            valid_len: 0,
            last_lsn: 0,
        })
    }

    /// Read the next record from the WAL
    ///
    /// Returns `Ok(None)` at a clean end of file, and `WalCorruption` for a
    /// torn frame, a CRC mismatch, or an out-of-sequence LSN.
    pub fn next_record(&mut self) -> Result<Option<(u64, WalRecord)>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                return Err(QuorumError::WalCorruption(format!(
                    "partial header at offset {} ({} bytes)",
                    self.valid_len, n
                )))
            }
            _ => {}
        }

        let header = FrameHeader::parse(&header);
        if header.len > MAX_RECORD_SIZE {
            return Err(QuorumError::WalCorruption(format!(
                "record length {} at offset {} exceeds max",
                header.len, self.valid_len
            )));
        }
        if header.lsn != self.last_lsn + 1 {
            return Err(QuorumError::WalCorruption(format!(
                "lsn {} follows {}",
                header.lsn, self.last_lsn
            )));
        }

        let mut payload = vec![0u8; header.len as usize];
        let read = read_full(&mut self.reader, &mut payload)?;
        if read < payload.len() {
            return Err(QuorumError::WalCorruption(format!(
                "partial payload for lsn {} ({} of {} bytes)",
                header.lsn,
                read,
                payload.len()
            )));
        }

        if crc32fast::hash(&payload) != header.crc {
            return Err(QuorumError::WalCorruption(format!(
                "crc mismatch for lsn {}",
                header.lsn
            )));
        }

        let record = WalRecord::decode(&payload)?;
        self.valid_len += (HEADER_SIZE + payload.len()) as u64;
        self.last_lsn = header.lsn;
        Ok(Some((header.lsn, record)))
    }

    /// Iterate over all records up to the first error
    pub fn records(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }

    /// Byte length of the clean prefix read so far
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// LSN of the last clean record read so far
    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }
}

/// Iterator over WAL records
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_record() {
            Ok(Some((_, record))) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the stream allows; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
