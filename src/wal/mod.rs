//! Write-Ahead Log (WAL) Module
//!
//! Durable, append-only record of everything the consensus engine asks us to
//! persist: log entries, hard-state changes and snapshot markers.
//!
//! ## Responsibilities
//! - Append records before the driver acts on them
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Crash recovery and replay, truncating torn tails
//! - Atomic rewrite after log compaction
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! `Data` is a bincode-encoded [`WalRecord`]; the CRC covers `Data` only.

mod entry;
mod writer;
mod reader;
mod recovery;

pub use entry::{EntryKind, LogRecord, WalRecord, HEADER_SIZE, MAX_RECORD_SIZE};
pub use writer::WalWriter;
pub use reader::WalReader;
pub use recovery::{WalRecovery, RecoveryResult};
