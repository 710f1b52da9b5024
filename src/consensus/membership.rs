//! Membership changes
//!
//! Topology changes never touch the engine directly. They are proposed as
//! ConfChange log entries, committed like any write, and applied by every
//! node when the entry comes out of the log:
//!
//! ```text
//!   propose_add_node ──► control loop ──► log ──► commit ──► apply_conf_change (engine)
//!                                                        └─► Membership::apply (view)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use raft::prelude::{ConfChange, ConfChangeType};

use crate::error::{QuorumError, Result};

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
}

/// A membership change as it travels through the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfChangeRecord {
    pub kind: ConfChangeKind,
    pub node_id: u64,
    /// Transport address of an added node
    pub context: Option<String>,
}

impl ConfChangeRecord {
    pub fn add_node(node_id: u64, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            kind: ConfChangeKind::AddNode,
            node_id,
            context: (!addr.is_empty()).then_some(addr),
        }
    }

    pub fn remove_node(node_id: u64) -> Self {
        Self {
            kind: ConfChangeKind::RemoveNode,
            node_id,
            context: None,
        }
    }

    /// Engine form of this change
    pub fn to_conf_change(&self) -> ConfChange {
        let mut cc = ConfChange::default();
        cc.set_change_type(match self.kind {
            ConfChangeKind::AddNode => ConfChangeType::AddNode,
            ConfChangeKind::RemoveNode => ConfChangeType::RemoveNode,
        });
        cc.node_id = self.node_id;
        if let Some(addr) = &self.context {
            cc.context = addr.as_bytes().to_vec().into();
        }
        cc
    }

    /// Record for an engine change; learner changes are not produced here
    pub fn from_conf_change(cc: &ConfChange) -> Option<Self> {
        let kind = match cc.get_change_type() {
            ConfChangeType::AddNode => ConfChangeKind::AddNode,
            ConfChangeType::RemoveNode => ConfChangeKind::RemoveNode,
            ConfChangeType::AddLearnerNode => return None,
        };
        let context = if cc.context.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&cc.context[..]).into_owned())
        };
        Some(Self {
            kind,
            node_id: cc.node_id,
            context,
        })
    }
}

/// Proposal path and application-visible view of cluster membership
#[derive(Clone)]
pub struct Membership {
    conf_tx: Sender<ConfChangeRecord>,
    /// Member id → transport address ("" when unknown)
    members: Arc<RwLock<BTreeMap<u64, String>>>,
}

impl Membership {
    /// Create the manager and the receiver the control loop drains
    pub fn new() -> (Self, Receiver<ConfChangeRecord>) {
        let (conf_tx, conf_rx) = unbounded();
        let membership = Self {
            conf_tx,
            members: Arc::new(RwLock::new(BTreeMap::new())),
        };
        (membership, conf_rx)
    }

    /// Propose adding `id` reachable at `addr`
    pub fn propose_add_node(&self, id: u64, addr: &str) -> Result<()> {
        self.propose(ConfChangeRecord::add_node(id, addr))
    }

    /// Propose removing `id`
    pub fn propose_remove_node(&self, id: u64) -> Result<()> {
        self.propose(ConfChangeRecord::remove_node(id))
    }

    fn propose(&self, record: ConfChangeRecord) -> Result<()> {
        tracing::info!(kind = ?record.kind, node = record.node_id, "proposing membership change");
        self.conf_tx
            .send(record)
            .map_err(|_| QuorumError::ProposalClosed)
    }

    /// Apply a committed change to the view
    pub fn apply(&self, record: &ConfChangeRecord) {
        let mut members = self.members.write();
        match record.kind {
            ConfChangeKind::AddNode => {
                let addr = record.context.clone().unwrap_or_default();
                let slot = members.entry(record.node_id).or_default();
                if !addr.is_empty() {
                    *slot = addr;
                }
            }
            ConfChangeKind::RemoveNode => {
                members.remove(&record.node_id);
            }
        }
    }

    /// Replace the view with the voters of an installed snapshot
    ///
    /// Addresses come from the snapshot image, falling back to any already
    /// known for the same member.
    pub fn reset(&self, voters: &[u64], addrs: &BTreeMap<u64, String>) {
        let mut members = self.members.write();
        members.retain(|id, _| voters.contains(id));
        for id in voters {
            let slot = members.entry(*id).or_default();
            if let Some(addr) = addrs.get(id).filter(|a| !a.is_empty()) {
                *slot = addr.clone();
            }
        }
    }

    /// Current members and their known addresses
    pub fn members(&self) -> BTreeMap<u64, String> {
        self.members.read().clone()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.read().contains_key(&id)
    }
}
