//! Configuration for QuorumKV
//!
//! Centralized configuration with sensible defaults. Everything a node needs
//! is passed in through [`Config`]; nothing is read from globals.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a QuorumKV node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Identity & Cluster
    // -------------------------------------------------------------------------
    /// This node's id (1-based, unique within the cluster)
    pub node_id: u64,

    /// Raft transport address of every initial cluster member, keyed by id
    pub peers: BTreeMap<u64, String>,

    /// Join an existing cluster instead of bootstrapping a new one
    pub join: bool,

    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     └── node-{id}/
    ///         ├── wal.log      (raft log + hard state records)
    ///         └── snap/        (snapshot images)
    pub data_dir: PathBuf,

    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,

    // -------------------------------------------------------------------------
    // Consensus Configuration
    // -------------------------------------------------------------------------
    /// Engine timing parameters
    pub raft: RaftTiming,

    /// When to snapshot and how much log to keep behind a snapshot
    pub snapshot: SnapshotPolicy,

    /// Outbound message dispatch
    pub dispatch: DispatchConfig,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// Client-facing TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,
}

/// WAL sync strategy for log entries
///
/// Hard-state changes and snapshot markers are synced under every strategy.
/// With `EveryNEntries` a node may acknowledge entries that a crash then
/// loses, so it is only safe while a majority stays up.
#[derive(Debug, Clone, Copy)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Timing knobs handed to the consensus engine
#[derive(Debug, Clone)]
pub struct RaftTiming {
    /// Wall-clock length of one logical tick
    pub tick_interval: Duration,
    /// Ticks without leader contact before a follower campaigns
    pub election_tick: usize,
    /// Ticks between leader heartbeats
    pub heartbeat_tick: usize,
    /// Max bytes of entries per append message
    pub max_size_per_msg: u64,
    /// Max in-flight append messages per follower
    pub max_inflight_msgs: usize,
    /// Cap on uncommitted entry bytes held by a leader
    pub max_uncommitted_size: u64,
    /// Poll for a majority before bumping the term, so a partitioned or
    /// removed node cannot force elections
    pub pre_vote: bool,
    /// Leaders step down when they lose contact with a quorum
    pub check_quorum: bool,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            max_uncommitted_size: 1 << 30,
            pre_vote: true,
            check_quorum: true,
        }
    }
}

/// Snapshot trigger and compaction window
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Applied entries since the last snapshot before a new one is taken
    pub snapshot_count: u64,
    /// Entries retained behind a snapshot so slow followers can catch up from the log
    pub catch_up_entries: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_count: 10_000,
            catch_up_entries: 10_000,
        }
    }
}

/// Outbound send pool sizing
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Sender threads per node
    pub workers: usize,
    /// Messages queued or in flight before new ones are dropped
    pub max_inflight: usize,
    /// Upper bound of the random delay applied to each send
    pub max_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_inflight: 4096,
            max_delay: Duration::from_millis(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: BTreeMap::from([(1, "127.0.0.1:12379".to_string())]),
            join: false,
            data_dir: PathBuf::from("./quorumkv_data"),
            wal_sync_strategy: WalSyncStrategy::EveryWrite,
            raft: RaftTiming::default(),
            snapshot: SnapshotPolicy::default(),
            dispatch: DispatchConfig::default(),
            listen_addr: "127.0.0.1:6379".to_string(),
            max_connections: 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding this node's WAL and snapshots
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }

    /// Raft address of this node, if it is one of the listed peers
    pub fn raft_addr(&self) -> Option<&str> {
        self.peers.get(&self.node_id).map(String::as_str)
    }
}

/// Parse a comma-separated peer list; ids are assigned by position starting at 1
pub fn parse_peers(list: &str) -> BTreeMap<u64, String> {
    list.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .enumerate()
        .map(|(i, addr)| (i as u64 + 1, addr.to_string()))
        .collect()
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set this node's id
    pub fn node_id(mut self, id: u64) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the initial cluster members
    pub fn peers(mut self, peers: BTreeMap<u64, String>) -> Self {
        self.config.peers = peers;
        self
    }

    /// Join an existing cluster rather than bootstrapping
    pub fn join(mut self, join: bool) -> Self {
        self.config.join = join;
        self
    }

    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the engine timing parameters
    pub fn raft_timing(mut self, timing: RaftTiming) -> Self {
        self.config.raft = timing;
        self
    }

    /// Set the logical tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.raft.tick_interval = interval;
        self
    }

    /// Set the snapshot policy
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.config.snapshot = policy;
        self
    }

    /// Set the outbound dispatch configuration
    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    /// Set the client TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
