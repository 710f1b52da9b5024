//! # QuorumKV
//!
//! A replicated key-value store driven by Raft consensus:
//! - Raft log and hard state persisted in a checksummed WAL
//! - Snapshots with log compaction gated on apply progress
//! - Membership changes carried through the log
//! - Pluggable transports (TCP, or a simulated fault-injecting network)
//! - TCP-based client protocol
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TCP Server                             │
//! │                  (Multiple Clients)                         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Replica                                │
//! │          KvStore ◄── commit batches ── RaftNode             │
//! └──────────┬───────────────────────────────────┬──────────────┘
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────┐                 ┌─────────────────┐
//!   │   RaftStorage   │                 │    Transport    │
//!   │  (WAL + snap/)  │                 │  (TCP or sim)   │
//!   └─────────────────┘                 └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod storage;
pub mod transport;
pub mod consensus;
pub mod kvstore;
pub mod protocol;
pub mod network;
pub mod replica;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{QuorumError, Result};
pub use config::Config;
pub use consensus::{Membership, NodeState, NodeStatus, RaftNode};
pub use kvstore::KvStore;
pub use replica::Replica;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of QuorumKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
