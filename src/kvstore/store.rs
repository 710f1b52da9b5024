//! Replicated KV store
//!
//! ```text
//!   propose(k, v) ──► proposal channel ──► control loop ──► log
//!                                                           │
//!   lookup(k) ◄── KvState ◄── apply consumer ◄── CommitBatch
//! ```

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::consensus::{CommitBatch, EntryPayload, Membership, SnapshotProvider};
use crate::error::{QuorumError, Result};
use crate::kvstore::KvState;

/// A client write as stored in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Client-facing side of the replicated state machine
pub struct KvStore {
    id: u64,
    state: Arc<KvState>,
    membership: Membership,
    propose_tx: Mutex<Option<Sender<Vec<u8>>>>,
    /// Set once the apply consumer hit an unrecoverable error
    failure: Arc<Mutex<Option<String>>>,
}

impl KvStore {
    /// Create the store and start its apply consumer on `commits`
    ///
    /// Returns the proposal receiver to hand to the node.
    pub fn new(
        id: u64,
        membership: Membership,
        commits: Receiver<CommitBatch>,
    ) -> Result<(Self, Receiver<Vec<u8>>)> {
        let (propose_tx, propose_rx) = unbounded();
        let state = Arc::new(KvState::new());
        let failure = Arc::new(Mutex::new(None));

        {
            let state = Arc::clone(&state);
            let membership = membership.clone();
            let failure = Arc::clone(&failure);
            thread::Builder::new()
                .name(format!("kv-apply-{}", id))
                .spawn(move || {
                    for batch in commits.iter() {
                        if let Err(e) = apply_batch(id, &state, &membership, &batch) {
                            tracing::error!(node = id, index = batch.index(), error = %e, "apply failed, stopping apply consumer");
                            // Recorded before the batch is released so no
                            // snapshot is taken of the broken state
                            *failure.lock() = Some(e.to_string());
                            drop(batch);
                            return;
                        }
                        batch.complete();
                    }
                    tracing::debug!(node = id, "apply consumer finished");
                })?;
        }

        let store = Self {
            id,
            state,
            membership,
            propose_tx: Mutex::new(Some(propose_tx)),
            failure,
        };
        Ok((store, propose_rx))
    }

    /// Submit a write; returns before it is replicated or applied
    pub fn propose(&self, key: &str, value: &str) -> Result<()> {
        let command = KvCommand::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        let bytes = command.encode()?;
        let guard = self.propose_tx.lock();
        let tx = guard.as_ref().ok_or(QuorumError::ProposalClosed)?;
        tx.send(bytes).map_err(|_| QuorumError::ProposalClosed)
    }

    /// Most recently applied value for `key`
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.state.get(key)
    }

    /// Encoded image of the current applied state and member addresses
    pub fn get_snapshot(&self) -> Result<Vec<u8>> {
        encode_image(&self.state, &self.membership, &self.failure)
    }

    /// Snapshot provider for the commit pipeline
    pub fn snapshot_provider(&self) -> SnapshotProvider {
        let state = Arc::clone(&self.state);
        let membership = self.membership.clone();
        let failure = Arc::clone(&self.failure);
        Arc::new(move || encode_image(&state, &membership, &failure))
    }

    /// Why the apply consumer stopped, if it failed
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Close the proposal path; later proposals fail with `ProposalClosed`
    pub fn close(&self) {
        if self.propose_tx.lock().take().is_some() {
            tracing::info!(node = self.id, "proposal channel closed");
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.state.applied_index()
    }

    pub fn applied_writes(&self) -> u64 {
        self.state.applied_writes()
    }

    pub fn state(&self) -> Arc<KvState> {
        Arc::clone(&self.state)
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }
}

fn encode_image(state: &KvState, membership: &Membership, failure: &Mutex<Option<String>>) -> Result<Vec<u8>> {
    if let Some(reason) = failure.lock().as_ref() {
        return Err(QuorumError::InvalidState(format!(
            "state machine stopped after apply failure: {}",
            reason
        )));
    }
    state.snapshot(&membership.members())
}

fn apply_batch(id: u64, state: &KvState, membership: &Membership, batch: &CommitBatch) -> Result<()> {
    if let Some(image) = &batch.snapshot {
        let addrs = state.restore(&image.data, image.index).map_err(|e| {
            QuorumError::Snapshot(format!("cannot decode image at index {}: {}", image.index, e))
        })?;
        if image.index > 0 {
            membership.reset(&image.voters, &addrs);
        }
        tracing::debug!(node = id, index = image.index, keys = state.len(), "installed snapshot image");
    }

    for entry in &batch.entries {
        match &entry.payload {
            EntryPayload::Write(bytes) => match KvCommand::decode(bytes) {
                Ok(KvCommand::Put { key, value }) => state.put(key, value, entry.index),
                Err(e) => {
                    tracing::warn!(node = id, index = entry.index, error = %e, "skipping undecodable write");
                    state.advance(entry.index);
                }
            },
            EntryPayload::ConfChange(record) => {
                membership.apply(record);
                state.advance(entry.index);
            }
            EntryPayload::Noop => state.advance(entry.index),
        }
    }
    Ok(())
}
