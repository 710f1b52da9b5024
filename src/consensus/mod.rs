//! Consensus Module
//!
//! Drives the raft engine for one node and feeds its output to the
//! application.
//!
//! ## Components
//! - [`RaftNode`]: lifecycle handle over a single-threaded control loop that
//!   exclusively owns the engine
//! - pipeline: ordered apply feed ([`CommitBatch`]) with the apply-done
//!   handshake that gates snapshots and log compaction
//! - [`Membership`]: add/remove node proposals and the applied member view
//!
//! ## Threads
//! ```text
//!   raft-node-{id}      control loop (engine, storage writes, pipeline)
//!   dispatch-{id}-{n}   outbound send pool
//!   kv-apply-{id}       apply consumer (owned by the kvstore)
//! ```

mod driver;
mod membership;
mod pipeline;

pub use driver::{NodeChannels, NodeRole, NodeState, NodeStatus, RaftNode};
pub use membership::{ConfChangeKind, ConfChangeRecord, Membership};
pub use pipeline::{CommitBatch, CommittedEntry, EntryPayload, SnapshotImage, SnapshotProvider};
