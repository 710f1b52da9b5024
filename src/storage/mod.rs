//! Storage Module
//!
//! Stable log storage for one node: the raft log, hard state and snapshots.
//!
//! ## Responsibilities
//! - Persist entries and hard state before the driver sends any message
//! - Serve the consensus engine's read contract from an in-memory mirror
//! - Save, load and purge snapshot images
//! - Compact the log behind a snapshot, keeping a catch-up window
//!
//! ## Directory Layout
//! ```text
//! node-{id}/
//! ├── wal.log                          (entries, hard states, log resets)
//! └── snap/
//!     └── {term:016x}-{index:016x}.snap (crc + bincode image)
//! ```
//!
//! On open the WAL is replayed first, then the newest snapshot is installed
//! if it is newer than the replayed log.

mod log_store;
mod snapshotter;

pub use log_store::RaftStorage;
pub use snapshotter::Snapshotter;
