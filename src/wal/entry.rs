//! WAL record definitions
//!
//! Defines the structure of individual WAL records and their framing.

use raft::prelude::{Entry, EntryType, HardState};
use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, Result};

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a single record payload (64 MB)
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// A single record in the WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A raft log entry
    Entry(LogRecord),

    /// A hard-state change (term, vote, commit)
    HardState { term: u64, vote: u64, commit: u64 },

    /// The log was reset to begin after (index, term), by installing a
    /// snapshot or by compaction
    Snapshot { index: u64, term: u64 },
}

/// Durable form of a raft log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
    pub context: Vec<u8>,
}

/// Entry payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfChange,
    ConfChangeV2,
}

impl From<&Entry> for LogRecord {
    fn from(entry: &Entry) -> Self {
        let kind = match entry.get_entry_type() {
            EntryType::EntryNormal => EntryKind::Normal,
            EntryType::EntryConfChange => EntryKind::ConfChange,
            EntryType::EntryConfChangeV2 => EntryKind::ConfChangeV2,
        };
        Self {
            index: entry.index,
            term: entry.term,
            kind,
            data: entry.data.to_vec(),
            context: entry.context.to_vec(),
        }
    }
}

impl LogRecord {
    /// Rebuild the engine's entry type
    pub fn to_entry(&self) -> Entry {
        let mut entry = Entry::default();
        entry.index = self.index;
        entry.term = self.term;
        entry.set_entry_type(match self.kind {
            EntryKind::Normal => EntryType::EntryNormal,
            EntryKind::ConfChange => EntryType::EntryConfChange,
            EntryKind::ConfChangeV2 => EntryType::EntryConfChangeV2,
        });
        entry.data = self.data.clone().into();
        entry.context = self.context.clone().into();
        entry
    }
}

impl WalRecord {
    /// Record for a hard-state change
    pub fn hard_state(hs: &HardState) -> Self {
        WalRecord::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        }
    }

    /// Encode a record into a complete frame with the given LSN
    pub fn encode(&self, lsn: u64) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_RECORD_SIZE as usize {
            return Err(QuorumError::WalWrite(format!(
                "record of {} bytes exceeds max {}",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a payload after its CRC has been verified
    pub fn decode(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|e| QuorumError::WalCorruption(format!("undecodable record: {}", e)))
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

impl FrameHeader {
    pub(crate) fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let lsn = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        let crc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let len = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Self { lsn, crc, len }
    }
}
