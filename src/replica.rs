//! Replica
//!
//! Wires one node together:
//!
//! ```text
//!   ┌──────────┐ proposals ┌──────────┐  Ready   ┌─────────────┐
//!   │ KvStore  │──────────►│ RaftNode │─────────►│ RaftStorage │
//!   │          │◄──────────│  (loop)  │          └─────────────┘
//!   └──────────┘  batches  └────┬─────┘
//!        ▲                      │ messages
//!   ┌────┴───────┐         ┌────▼──────┐
//!   │ Membership │────────►│ Transport │
//!   └────────────┘  conf   └───────────┘
//! ```

use std::sync::Arc;

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use crate::config::Config;
use crate::consensus::{Membership, NodeChannels, NodeState, NodeStatus, RaftNode};
use crate::error::{QuorumError, Result};
use crate::kvstore::KvStore;
use crate::storage::RaftStorage;
use crate::transport::{TcpTransport, Transport};

/// One member of a replicated KV cluster
pub struct Replica {
    id: u64,
    node: Mutex<RaftNode>,
    kv: KvStore,
    membership: Membership,
}

impl Replica {
    /// Start a replica over an existing transport
    pub fn start(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let id = config.node_id;
        let (membership, conf_rx) = Membership::new();
        let (commit_tx, commit_rx) = bounded(0);
        let (kv, proposals) = KvStore::new(id, membership.clone(), commit_rx)?;

        let channels = NodeChannels {
            proposals,
            conf_changes: conf_rx,
            commits: commit_tx,
        };
        let node = RaftNode::start(config, transport, channels, kv.snapshot_provider())?;

        Ok(Self {
            id,
            node: Mutex::new(node),
            kv,
            membership,
        })
    }

    /// Start a replica with a TCP transport bound to its own peer address
    pub fn start_tcp(config: Config) -> Result<Self> {
        let addr = config
            .raft_addr()
            .ok_or_else(|| {
                QuorumError::Config(format!("node {} is missing from the peer list", config.node_id))
            })?
            .to_string();
        let transport = TcpTransport::bind(config.node_id, &addr, &config.peers)?;
        Self::start(config, Arc::new(transport))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // =========================================================================
    // Client Operations
    // =========================================================================

    /// Propose a write; returns before it commits
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.kv.propose(key, value)
    }

    /// Applied value of `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.kv.lookup(key)
    }

    /// Propose adding a node
    pub fn add_node(&self, id: u64, addr: &str) -> Result<()> {
        self.membership.propose_add_node(id, addr)
    }

    /// Propose removing a node
    pub fn remove_node(&self, id: u64) -> Result<()> {
        self.membership.propose_remove_node(id)
    }

    /// Liveness: the control loop is running
    pub fn is_serving(&self) -> bool {
        self.node.lock().state() == NodeState::Running
    }

    // =========================================================================
    // Node Control
    // =========================================================================

    pub fn status(&self) -> NodeStatus {
        self.node.lock().status()
    }

    pub fn pause(&self) -> Result<()> {
        self.node.lock().pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.node.lock().resume()
    }

    pub fn campaign(&self) -> Result<()> {
        self.node.lock().campaign()
    }

    pub fn stop(&self) -> Result<()> {
        self.node.lock().stop()
    }

    pub fn restart(&self) -> Result<()> {
        self.node.lock().restart()
    }

    /// Close the proposal path, then stop the node
    pub fn shutdown(&self) -> Result<()> {
        self.kv.close();
        let mut node = self.node.lock();
        if node.state() == NodeState::Stopped {
            return Ok(());
        }
        node.stop()
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Storage of the running node, if any
    pub fn storage(&self) -> Option<RaftStorage> {
        self.node.lock().storage()
    }

    /// Fatal errors from the control loop
    pub fn errors(&self) -> crossbeam::channel::Receiver<QuorumError> {
        self.node.lock().errors()
    }
}
