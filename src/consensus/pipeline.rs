//! Commit/Snapshot Pipeline
//!
//! Turns the engine's committed entries into ordered [`CommitBatch`]es for the
//! single apply consumer, and gates snapshots on that consumer's progress.
//!
//! ```text
//!   control loop                        apply consumer
//!   ────────────                        ──────────────
//!   publish(batch N) ──rendezvous──►    recv batch N
//!   threshold reached?                  apply entries
//!     wait done(N) ◄──────────────────  drop batch (closes done)
//!     provider() → image
//!     create_snapshot(applied)
//!     compact(applied - catch_up)
//! ```
//!
//! The commit channel has no buffer, so the loop cannot hand over batch N+1
//! while the consumer is still busy with batch N, and a snapshot is never
//! taken ahead of what the consumer has applied.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use raft::prelude::{ConfState, Snapshot};

use crate::config::SnapshotPolicy;
use crate::consensus::ConfChangeRecord;
use crate::error::{QuorumError, Result};
use crate::storage::RaftStorage;

/// Produces the state machine image at the current applied index
pub type SnapshotProvider = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

// =============================================================================
// Batches
// =============================================================================

/// Payload of one committed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    /// Client proposal bytes
    Write(Vec<u8>),
    /// Membership change, already applied to the engine
    ConfChange(ConfChangeRecord),
    /// Empty entry appended by a new leader
    Noop,
}

/// A committed log entry ready to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

/// State machine image carried by a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    pub index: u64,
    pub term: u64,
    /// Voters as of `index`
    pub voters: Vec<u64>,
    pub data: Vec<u8>,
}

/// Ordered group of committed entries, optionally preceded by a snapshot
///
/// Dropping the batch (or calling [`CommitBatch::complete`]) tells the
/// pipeline it has been applied.
#[derive(Debug)]
pub struct CommitBatch {
    pub snapshot: Option<SnapshotImage>,
    pub entries: Vec<CommittedEntry>,
    _done: Sender<()>,
}

impl CommitBatch {
    /// New batch plus the signal that closes once the batch is dropped
    pub(crate) fn new(
        snapshot: Option<SnapshotImage>,
        entries: Vec<CommittedEntry>,
    ) -> (Self, Receiver<()>) {
        let (done_tx, done_rx) = bounded::<()>(0);
        let batch = Self {
            snapshot,
            entries,
            _done: done_tx,
        };
        (batch, done_rx)
    }

    /// Highest index covered by this batch
    pub fn index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .or_else(|| self.snapshot.as_ref().map(|s| s.index))
            .unwrap_or(0)
    }

    /// Signal that every entry in the batch has been applied
    pub fn complete(self) {}
}

// =============================================================================
// Pipeline
// =============================================================================

/// Producer side of the apply feed, owned by the control loop
pub(crate) struct CommitPipeline {
    id: u64,
    storage: RaftStorage,
    policy: SnapshotPolicy,
    provider: SnapshotProvider,
    commit_tx: Sender<CommitBatch>,
    stop_rx: Receiver<()>,

    conf_state: ConfState,
    applied_index: u64,
    snapshot_index: u64,
    /// Completion signal of the newest published batch
    pending_done: Option<Receiver<()>>,
}

impl CommitPipeline {
    pub(crate) fn new(
        id: u64,
        storage: RaftStorage,
        policy: SnapshotPolicy,
        provider: SnapshotProvider,
        commit_tx: Sender<CommitBatch>,
        stop_rx: Receiver<()>,
    ) -> Self {
        let conf_state = storage.conf_state();
        let snapshot_index = storage.snapshot_index();
        Self {
            id,
            storage,
            policy,
            provider,
            commit_tx,
            stop_rx,
            conf_state,
            applied_index: snapshot_index,
            snapshot_index,
            pending_done: None,
        }
    }

    pub(crate) fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub(crate) fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    /// Track membership as the loop applies conf changes
    pub(crate) fn set_conf_state(&mut self, conf_state: ConfState) {
        self.conf_state = conf_state;
    }

    /// Hand a snapshot to the consumer; it replaces the whole state
    ///
    /// Also used on every (re)start with the stored snapshot, which may be
    /// empty, so the consumer never carries state across a restart.
    pub(crate) fn install(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let conf_state = meta.get_conf_state().clone();
        let image = SnapshotImage {
            index: meta.index,
            term: meta.term,
            voters: conf_state.voters.clone(),
            data: snapshot.data.to_vec(),
        };

        self.send(Some(image), Vec::new())?;

        self.applied_index = meta.index;
        self.snapshot_index = meta.index;
        if meta.index > 0 {
            self.conf_state = conf_state;
        }
        tracing::debug!(node = self.id, index = meta.index, "published snapshot to apply consumer");
        Ok(())
    }

    /// Publish committed entries, then snapshot if the policy says so
    pub(crate) fn publish(&mut self, entries: Vec<CommittedEntry>) -> Result<()> {
        let applied = self.applied_index;
        let entries: Vec<CommittedEntry> =
            entries.into_iter().filter(|e| e.index > applied).collect();
        let Some(last) = entries.last().map(|e| e.index) else {
            return Ok(());
        };
        if entries[0].index != applied + 1 {
            return Err(QuorumError::InvalidState(format!(
                "first committed index {} should be {}",
                entries[0].index,
                applied + 1
            )));
        }

        self.send(None, entries)?;
        self.applied_index = last;
        self.maybe_trigger_snapshot()
    }

    fn send(&mut self, snapshot: Option<SnapshotImage>, entries: Vec<CommittedEntry>) -> Result<()> {
        let (batch, done_rx) = CommitBatch::new(snapshot, entries);

        select! {
            send(self.commit_tx, batch) -> res => {
                res.map_err(|_| QuorumError::InvalidState("apply consumer is gone".to_string()))?;
            }
            recv(self.stop_rx) -> _ => return Err(QuorumError::NodeStopped(self.id)),
        }

        self.pending_done = Some(done_rx);
        Ok(())
    }

    /// Snapshot and compact once enough entries were applied, or when the
    /// engine asked for a snapshot the storage could not serve
    ///
    /// Blocks until the consumer has completed the newest batch.
    pub(crate) fn maybe_trigger_snapshot(&mut self) -> Result<()> {
        let requested = self.storage.snapshot_requested();
        let since = self.applied_index.saturating_sub(self.snapshot_index);
        if self.applied_index == 0 || (!requested && since <= self.policy.snapshot_count) {
            return Ok(());
        }

        if let Some(done) = self.pending_done.take() {
            select! {
                recv(done) -> _ => {}
                recv(self.stop_rx) -> _ => return Err(QuorumError::NodeStopped(self.id)),
            }
        }

        tracing::info!(
            node = self.id,
            applied = self.applied_index,
            last_snapshot = self.snapshot_index,
            requested,
            "starting snapshot"
        );

        let data = (self.provider)()?;
        self.storage
            .create_snapshot(self.applied_index, self.conf_state.clone(), data)?;

        let compact_index = self
            .applied_index
            .saturating_sub(self.policy.catch_up_entries)
            .max(1);
        self.storage.compact(compact_index)?;

        self.snapshot_index = self.applied_index;
        Ok(())
    }
}
