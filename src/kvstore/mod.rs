//! KV Store Module
//!
//! The replicated state machine: a string → string map rebuilt from the
//! apply feed.
//!
//! ## Responsibilities
//! - Propose writes into the log (optimistic, returns before commit)
//! - Apply committed batches in index order on a single consumer thread
//! - Answer point lookups from the applied state
//! - Produce and install snapshot images
//!
//! ## Data Structure Choice
//! BTreeMap behind a parking_lot RwLock:
//! - One writer (the apply consumer), many concurrent readers
//! - Ordered keys give a deterministic snapshot encoding

mod state;
mod store;

pub use state::KvState;
pub use store::{KvCommand, KvStore};
