//! Raft Node Driver
//!
//! [`RaftNode`] is the handle; the engine itself lives on a dedicated
//! control-loop thread that is the only code allowed to mutate it.
//!
//! ## Lifecycle
//! ```text
//!   Running ──pause──► Paused ──resume──► Running
//!   Running ──stop───► Stopping ────────► Stopped
//!   Stopped ──restart► Restarting ──────► Running
//! ```
//!
//! ## Ready Handling
//! 1. Install any incoming snapshot into storage
//! 2. Persist hard state and new entries (one synced write)
//! 3. Publish snapshot / committed entries to the pipeline
//! 4. Dispatch outbound messages through the send pool
//! 5. Advance, then repeat 2-4 for the light ready

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, bounded, never, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Mutex, RwLock};
use prost::Message as _;
use raft::prelude::{ConfChange, Entry, EntryType, Message, Snapshot};
use raft::{RawNode, StateRole, INVALID_ID};
use slog::o;

use crate::config::Config;
use crate::consensus::pipeline::{CommitBatch, CommitPipeline, CommittedEntry, EntryPayload, SnapshotProvider};
use crate::consensus::{ConfChangeKind, ConfChangeRecord};
use crate::error::{QuorumError, Result};
use crate::storage::RaftStorage;
use crate::transport::{Dispatcher, Transport};

/// Proposals held while no leader is known
const MAX_PENDING_PROPOSALS: usize = 4096;

// =============================================================================
// Public Types
// =============================================================================

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    Paused,
    Stopping,
    Stopped,
    Restarting,
}

/// Engine role as last observed by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<StateRole> for NodeRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => NodeRole::Follower,
            StateRole::PreCandidate => NodeRole::PreCandidate,
            StateRole::Candidate => NodeRole::Candidate,
            StateRole::Leader => NodeRole::Leader,
        }
    }
}

/// Point-in-time view of a node, refreshed by the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: u64,
    pub state: NodeState,
    pub role: NodeRole,
    pub leader_id: u64,
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
    /// Last index handed to the apply consumer
    pub applied: u64,
    pub snapshot_index: u64,
}

impl NodeStatus {
    fn initial(id: u64) -> Self {
        Self {
            id,
            state: NodeState::Stopped,
            role: NodeRole::Follower,
            leader_id: INVALID_ID,
            term: 0,
            vote: 0,
            commit: 0,
            applied: 0,
            snapshot_index: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// Channels connecting a node to its application
#[derive(Clone)]
pub struct NodeChannels {
    /// Client proposals (encoded commands)
    pub proposals: Receiver<Vec<u8>>,
    /// Membership change proposals
    pub conf_changes: Receiver<ConfChangeRecord>,
    /// Apply feed towards the state machine
    pub commits: Sender<CommitBatch>,
}

enum Control {
    Pause(Sender<()>),
    Resume(Sender<()>),
    Campaign(Sender<Result<()>>),
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to one consensus node
pub struct RaftNode {
    id: u64,
    config: Config,
    transport: Arc<dyn Transport>,
    channels: NodeChannels,
    provider: SnapshotProvider,

    state: Mutex<NodeState>,
    status: Arc<RwLock<NodeStatus>>,
    storage: Option<RaftStorage>,

    control_tx: Option<Sender<Control>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,

    error_tx: Sender<QuorumError>,
    error_rx: Receiver<QuorumError>,
}

impl RaftNode {
    /// Open storage, bootstrap it if needed, start the loop and connect
    pub fn start(
        config: Config,
        transport: Arc<dyn Transport>,
        channels: NodeChannels,
        provider: SnapshotProvider,
    ) -> Result<Self> {
        let (error_tx, error_rx) = channel::unbounded();
        let mut node = Self {
            id: config.node_id,
            status: Arc::new(RwLock::new(NodeStatus::initial(config.node_id))),
            config,
            transport,
            channels,
            provider,
            state: Mutex::new(NodeState::Stopped),
            storage: None,
            control_tx: None,
            stop_tx: None,
            handle: None,
            error_tx,
            error_rx,
        };

        let storage = node.open_storage()?;
        if storage.is_empty() && !node.config.join {
            storage.bootstrap(&node.config.peers)?;
        }
        node.launch(storage)?;
        Ok(node)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lifecycle state; a loop that exited on its own (removal, fatal
    /// error) reports `Stopped`
    pub fn state(&self) -> NodeState {
        let state = *self.state.lock();
        if matches!(state, NodeState::Running | NodeState::Paused) && self.loop_exited() {
            return NodeState::Stopped;
        }
        state
    }

    /// Latest status published by the loop
    pub fn status(&self) -> NodeStatus {
        let mut status = self.status.read().clone();
        status.state = self.state();
        status
    }

    /// Fatal errors reported by the loop (persistence failures)
    pub fn errors(&self) -> Receiver<QuorumError> {
        self.error_rx.clone()
    }

    /// Storage handle of the running loop
    pub fn storage(&self) -> Option<RaftStorage> {
        self.storage.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Buffer inbound messages instead of stepping them
    pub fn pause(&self) -> Result<()> {
        self.expect_state(NodeState::Running, "pause")?;
        self.round_trip(Control::Pause)?;
        self.set_state(NodeState::Paused);
        tracing::info!(node = self.id, "paused");
        Ok(())
    }

    /// Step every buffered message in arrival order, then carry on
    pub fn resume(&self) -> Result<()> {
        self.expect_state(NodeState::Paused, "resume")?;
        self.round_trip(Control::Resume)?;
        self.set_state(NodeState::Running);
        tracing::info!(node = self.id, "resumed");
        Ok(())
    }

    /// Ask the engine to start an election now
    pub fn campaign(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control(Control::Campaign(ack_tx))?;
        ack_rx.recv().map_err(|_| QuorumError::NodeStopped(self.id))?
    }

    /// Disconnect, stop the loop and wait for it to exit
    ///
    /// In-memory engine state is discarded; persisted state is untouched.
    pub fn stop(&mut self) -> Result<()> {
        let state = self.state();
        if matches!(state, NodeState::Stopped | NodeState::Stopping) {
            // A loop that exited on its own still has a thread to join
            self.reap();
            return Err(QuorumError::InvalidState(format!(
                "node {} is already stopped",
                self.id
            )));
        }

        self.set_state(NodeState::Stopping);
        self.reap();
        tracing::info!(node = self.id, "stopped");
        Ok(())
    }

    /// Rebuild the engine from disk and rejoin the network
    pub fn restart(&mut self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Stopped {
            return Err(QuorumError::InvalidState(format!(
                "node {} must be stopped before restart (is {:?})",
                self.id, state
            )));
        }
        self.reap();
        self.set_state(NodeState::Restarting);

        let launched = self.open_storage().and_then(|storage| self.launch(storage));
        if launched.is_err() {
            self.set_state(NodeState::Stopped);
        }
        launched
    }

    /// Tear down the loop thread and its channels, if any remain
    fn reap(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.transport.disconnect();
        self.stop_tx.take();
        if handle.join().is_err() {
            tracing::error!(node = self.id, "control loop panicked");
        }
        self.control_tx.take();
        self.storage.take();
        self.set_state(NodeState::Stopped);
    }

    fn open_storage(&self) -> Result<RaftStorage> {
        RaftStorage::open(&self.config.node_dir(), self.config.wal_sync_strategy)
    }

    fn launch(&mut self, storage: RaftStorage) -> Result<()> {
        let (control_tx, control_rx) = channel::unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (init_tx, init_rx) = bounded::<Result<()>>(1);

        let ctx = LoopContext {
            config: self.config.clone(),
            storage: storage.clone(),
            transport: Arc::clone(&self.transport),
            channels: self.channels.clone(),
            provider: Arc::clone(&self.provider),
            control_rx,
            stop_rx,
            status: Arc::clone(&self.status),
        };
        let error_tx = self.error_tx.clone();
        let id = self.id;

        let handle = thread::Builder::new()
            .name(format!("raft-node-{}", id))
            .spawn(move || {
                let mut control = match ControlLoop::new(ctx) {
                    Ok(control) => {
                        let _ = init_tx.send(Ok(()));
                        control
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                match control.run() {
                    Ok(()) | Err(QuorumError::NodeStopped(_)) => {}
                    Err(e) => {
                        tracing::error!(node = id, error = %e, "control loop failed");
                        let _ = error_tx.send(e);
                    }
                }
            })?;

        init_rx
            .recv()
            .map_err(|_| QuorumError::InvalidState("control loop exited during start".to_string()))??;

        self.handle = Some(handle);
        self.control_tx = Some(control_tx);
        self.stop_tx = Some(stop_tx);
        self.storage = Some(storage);

        self.transport.connect()?;
        self.set_state(NodeState::Running);
        tracing::info!(node = self.id, "node running");
        Ok(())
    }

    fn round_trip(&self, make: fn(Sender<()>) -> Control) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control(make(ack_tx))?;
        ack_rx.recv().map_err(|_| QuorumError::NodeStopped(self.id))
    }

    fn control(&self, msg: Control) -> Result<()> {
        self.control_tx
            .as_ref()
            .ok_or(QuorumError::NodeStopped(self.id))?
            .send(msg)
            .map_err(|_| QuorumError::NodeStopped(self.id))
    }

    fn expect_state(&self, expected: NodeState, op: &str) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(QuorumError::InvalidState(format!(
                "cannot {} node {} while {:?}",
                op, self.id, state
            )));
        }
        Ok(())
    }

    fn loop_exited(&self) -> bool {
        self.handle.as_ref().map_or(false, JoinHandle::is_finished)
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
        self.status.write().state = state;
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.reap();
    }
}

// =============================================================================
// Control Loop
// =============================================================================

struct LoopContext {
    config: Config,
    storage: RaftStorage,
    transport: Arc<dyn Transport>,
    channels: NodeChannels,
    provider: SnapshotProvider,
    control_rx: Receiver<Control>,
    stop_rx: Receiver<()>,
    status: Arc<RwLock<NodeStatus>>,
}

struct ControlLoop {
    id: u64,
    raw: RawNode<RaftStorage>,
    storage: RaftStorage,
    pipeline: CommitPipeline,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,

    inbound: Receiver<Message>,
    proposals: Receiver<Vec<u8>>,
    conf_changes: Receiver<ConfChangeRecord>,
    control_rx: Receiver<Control>,
    stop_rx: Receiver<()>,

    status: Arc<RwLock<NodeStatus>>,
    tick_interval: Duration,

    paused: bool,
    buffered: VecDeque<Message>,
    pending_proposals: VecDeque<Vec<u8>>,
    last_role: StateRole,
    removed: bool,
}

impl ControlLoop {
    fn new(ctx: LoopContext) -> Result<Self> {
        let id = ctx.config.node_id;
        let timing = &ctx.config.raft;
        let raft_config = raft::Config {
            id,
            election_tick: timing.election_tick,
            heartbeat_tick: timing.heartbeat_tick,
            max_size_per_msg: timing.max_size_per_msg,
            max_inflight_msgs: timing.max_inflight_msgs,
            max_uncommitted_size: timing.max_uncommitted_size,
            pre_vote: timing.pre_vote,
            check_quorum: timing.check_quorum,
            applied: ctx.storage.snapshot_index(),
            ..Default::default()
        };
        raft_config.validate()?;

        // The engine's own logging is discarded; the loop logs through tracing
        let logger = slog::Logger::root(slog::Discard, o!());
        let raw = RawNode::new(&raft_config, ctx.storage.clone(), &logger)?;

        let pipeline = CommitPipeline::new(
            id,
            ctx.storage.clone(),
            ctx.config.snapshot,
            ctx.provider,
            ctx.channels.commits.clone(),
            ctx.stop_rx.clone(),
        );
        let dispatcher = Dispatcher::new(id, &ctx.config.dispatch, Arc::clone(&ctx.transport));

        Ok(Self {
            id,
            raw,
            storage: ctx.storage,
            pipeline,
            inbound: ctx.transport.receive(),
            transport: ctx.transport,
            dispatcher,
            proposals: ctx.channels.proposals,
            conf_changes: ctx.channels.conf_changes,
            control_rx: ctx.control_rx,
            stop_rx: ctx.stop_rx,
            status: ctx.status,
            tick_interval: ctx.config.raft.tick_interval,
            paused: false,
            buffered: VecDeque::new(),
            pending_proposals: VecDeque::new(),
            last_role: StateRole::Follower,
            removed: false,
        })
    }

    fn run(&mut self) -> Result<()> {
        // The consumer starts from the stored snapshot, empty or not
        let snapshot = self.storage.latest_snapshot();
        self.pipeline.install(&snapshot)?;

        let ticker = channel::tick(self.tick_interval);
        let mut proposals = self.proposals.clone();
        let mut conf_changes = self.conf_changes.clone();
        let inbound = self.inbound.clone();
        let control_rx = self.control_rx.clone();
        let stop_rx = self.stop_rx.clone();

        loop {
            if self.paused {
                select! {
                    recv(inbound) -> msg => {
                        if let Ok(msg) = msg {
                            self.buffered.push_back(msg);
                        }
                    }
                    recv(control_rx) -> ctl => {
                        if let Ok(ctl) = ctl {
                            self.handle_control(ctl);
                        }
                    }
                    recv(stop_rx) -> _ => return Ok(()),
                }
                continue;
            }

            let mut proposals_closed = false;
            let mut conf_changes_closed = false;
            select! {
                recv(ticker) -> _ => {
                    self.raw.tick();
                }
                recv(inbound) -> msg => {
                    if let Ok(msg) = msg {
                        self.step(msg);
                    }
                }
                recv(proposals) -> data => match data {
                    Ok(data) => self.propose(data),
                    Err(_) => proposals_closed = true,
                },
                recv(conf_changes) -> record => match record {
                    Ok(record) => self.propose_conf_change(&record),
                    Err(_) => conf_changes_closed = true,
                },
                recv(control_rx) -> ctl => {
                    if let Ok(ctl) = ctl {
                        self.handle_control(ctl);
                    }
                }
                recv(stop_rx) -> _ => return Ok(()),
            }
            if proposals_closed {
                tracing::info!(node = self.id, "proposal channel closed");
                proposals = never();
            }
            if conf_changes_closed {
                conf_changes = never();
            }

            self.on_ready()?;
            self.retry_pending_proposals();
            if self.storage.snapshot_requested() {
                self.pipeline.maybe_trigger_snapshot()?;
            }
            self.publish_status();

            if self.removed {
                tracing::info!(node = self.id, "removed from cluster, stopping control loop");
                return Ok(());
            }
        }
    }

    fn handle_control(&mut self, ctl: Control) {
        match ctl {
            Control::Pause(ack) => {
                self.paused = true;
                let _ = ack.send(());
            }
            Control::Resume(ack) => {
                self.paused = false;
                let buffered = std::mem::take(&mut self.buffered);
                tracing::debug!(node = self.id, count = buffered.len(), "stepping buffered messages");
                for msg in buffered {
                    self.step(msg);
                }
                let _ = ack.send(());
            }
            Control::Campaign(ack) => {
                let _ = ack.send(self.raw.campaign().map_err(QuorumError::from));
            }
        }
    }

    // =========================================================================
    // Engine Input
    // =========================================================================

    fn step(&mut self, msg: Message) {
        let (from, kind) = (msg.from, msg.get_msg_type());
        if let Err(e) = self.raw.step(msg) {
            tracing::debug!(node = self.id, from, kind = ?kind, error = %e, "step failed, dropping message");
        }
    }

    fn propose(&mut self, data: Vec<u8>) {
        if self.raw.raft.leader_id == INVALID_ID {
            self.hold_proposal(data);
            return;
        }
        if let Err(e) = self.raw.propose(vec![], data.clone()) {
            tracing::debug!(node = self.id, error = %e, "proposal dropped by engine, holding");
            self.hold_proposal(data);
        }
    }

    fn hold_proposal(&mut self, data: Vec<u8>) {
        if self.pending_proposals.len() >= MAX_PENDING_PROPOSALS {
            tracing::warn!(node = self.id, "too many proposals waiting for a leader, dropping");
            return;
        }
        self.pending_proposals.push_back(data);
    }

    fn retry_pending_proposals(&mut self) {
        if self.pending_proposals.is_empty() || self.raw.raft.leader_id == INVALID_ID {
            return;
        }
        let pending = std::mem::take(&mut self.pending_proposals);
        for data in pending {
            self.propose(data);
        }
    }

    fn propose_conf_change(&mut self, record: &ConfChangeRecord) {
        let cc = record.to_conf_change();
        let context = record.context.clone().unwrap_or_default().into_bytes();
        if let Err(e) = self.raw.propose_conf_change(context, cc) {
            tracing::warn!(node = self.id, node_id = record.node_id, error = %e, "conf change proposal dropped");
        }
    }

    // =========================================================================
    // Ready Handling
    // =========================================================================

    fn on_ready(&mut self) -> Result<()> {
        if !self.raw.has_ready() {
            return Ok(());
        }
        let mut ready = self.raw.ready();

        let snapshot = ready.snapshot().clone();
        let has_snapshot = snapshot != Snapshot::default();
        if has_snapshot {
            self.storage.apply_snapshot(snapshot.clone())?;
        }

        let hard_state = ready.hs().cloned().unwrap_or_default();
        self.storage.persist(&hard_state, ready.entries())?;

        if has_snapshot {
            self.pipeline.install(&snapshot)?;
        }
        let committed = ready.take_committed_entries();
        self.forward_committed(committed)?;

        self.dispatch(ready.take_messages());
        self.dispatch(ready.take_persisted_messages());

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.dispatch(light.take_messages());
        let committed = light.take_committed_entries();
        self.forward_committed(committed)?;
        self.raw.advance_apply();
        Ok(())
    }

    fn dispatch(&mut self, msgs: Vec<Message>) {
        for msg in msgs {
            self.dispatcher.dispatch(msg);
        }
    }

    fn forward_committed(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = match entry.get_entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => EntryPayload::Noop,
                EntryType::EntryNormal => EntryPayload::Write(entry.data.to_vec()),
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    tracing::warn!(node = self.id, index = entry.index, "ignoring joint conf change");
                    EntryPayload::Noop
                }
            };
            batch.push(CommittedEntry {
                index: entry.index,
                term: entry.term,
                payload,
            });
        }
        self.pipeline.publish(batch)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<EntryPayload> {
        let cc = ConfChange::decode(&entry.data[..])?;
        let Some(record) = ConfChangeRecord::from_conf_change(&cc) else {
            return Ok(EntryPayload::Noop);
        };

        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(cs) => cs,
            Err(e) => {
                tracing::warn!(node = self.id, index = entry.index, error = %e, "conf change rejected by engine");
                return Ok(EntryPayload::Noop);
            }
        };
        self.storage.set_conf_state(conf_state.clone());
        self.pipeline.set_conf_state(conf_state);

        match record.kind {
            ConfChangeKind::AddNode => {
                if let Some(addr) = &record.context {
                    self.transport.add_peer(record.node_id, addr);
                }
            }
            ConfChangeKind::RemoveNode => {
                if record.node_id == self.id {
                    self.removed = true;
                } else {
                    self.transport.remove_peer(record.node_id);
                }
            }
        }
        tracing::info!(
            node = self.id,
            index = entry.index,
            kind = ?record.kind,
            target = record.node_id,
            "applied membership change"
        );
        Ok(EntryPayload::ConfChange(record))
    }

    fn publish_status(&mut self) {
        let st = self.raw.status();
        let role = st.ss.raft_state;
        let mut status = self.status.write();
        status.role = role.into();
        status.leader_id = st.ss.leader_id;
        status.term = st.hs.term;
        status.vote = st.hs.vote;
        status.commit = st.hs.commit;
        status.applied = self.pipeline.applied_index();
        status.snapshot_index = self.pipeline.snapshot_index();
        drop(status);

        if role != self.last_role {
            tracing::info!(
                node = self.id,
                from = ?self.last_role,
                to = ?role,
                term = st.hs.term,
                leader = st.ss.leader_id,
                "role changed"
            );
            self.last_role = role;
        }
    }
}
