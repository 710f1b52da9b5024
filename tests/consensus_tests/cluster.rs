//! In-process cluster harness over the simulated network

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quorumkv::config::{DispatchConfig, RaftTiming, SnapshotPolicy};
use quorumkv::transport::SimNetwork;
use quorumkv::{Config, NodeState, Replica};
use tempfile::TempDir;

pub const TICK: Duration = Duration::from_millis(10);
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn sim_peers(ids: impl IntoIterator<Item = u64>) -> BTreeMap<u64, String> {
    ids.into_iter().map(|id| (id, format!("sim-{}", id))).collect()
}

pub fn node_config(
    data_dir: &TempDir,
    id: u64,
    peers: BTreeMap<u64, String>,
    join: bool,
    policy: SnapshotPolicy,
) -> Config {
    Config::builder()
        .node_id(id)
        .peers(peers)
        .join(join)
        .data_dir(data_dir.path())
        .raft_timing(RaftTiming {
            tick_interval: TICK,
            ..RaftTiming::default()
        })
        .snapshot_policy(policy)
        .dispatch(DispatchConfig {
            workers: 2,
            max_inflight: 4096,
            max_delay: Duration::from_micros(500),
        })
        .build()
}

pub struct Cluster {
    pub net: SimNetwork,
    pub nodes: BTreeMap<u64, Arc<Replica>>,
    peers: BTreeMap<u64, String>,
    policy: SnapshotPolicy,
    data_dir: TempDir,
}

impl Cluster {
    pub fn new(size: u64) -> Self {
        Self::with_policy(size, SnapshotPolicy::default())
    }

    pub fn with_policy(size: u64, policy: SnapshotPolicy) -> Self {
        let mut cluster = Self {
            net: SimNetwork::new(),
            nodes: BTreeMap::new(),
            peers: sim_peers(1..=size),
            policy,
            data_dir: TempDir::new().unwrap(),
        };
        for id in 1..=size {
            cluster.start_node(id, false);
        }
        cluster
    }

    /// Start node `id`; a joiner starts with an empty log
    pub fn start_node(&mut self, id: u64, join: bool) {
        let mut peers = self.peers.clone();
        peers.insert(id, format!("sim-{}", id));
        let config = node_config(&self.data_dir, id, peers, join, self.policy);
        let transport = Arc::new(self.net.endpoint(id));
        let replica = Replica::start(config, transport).unwrap();
        self.nodes.insert(id, Arc::new(replica));
    }

    pub fn node(&self, id: u64) -> &Replica {
        &self.nodes[&id]
    }

    fn running(&self) -> impl Iterator<Item = (&u64, &Arc<Replica>)> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.status().state == NodeState::Running)
    }

    /// The single leader every running node agrees on, if there is one now
    pub fn agreed_leader(&self) -> Option<u64> {
        let leaders: Vec<u64> = self
            .running()
            .filter(|(_, r)| r.status().is_leader())
            .map(|(id, _)| *id)
            .collect();
        if leaders.len() != 1 {
            return None;
        }
        let leader = leaders[0];
        self.running()
            .all(|(_, r)| r.status().leader_id == leader)
            .then_some(leader)
    }

    /// Wait for a leader that every running node agrees on
    pub fn wait_leader(&self) -> u64 {
        let mut found = None;
        assert!(
            wait_until(ELECTION_TIMEOUT, || {
                found = self.agreed_leader();
                found.is_some()
            }),
            "no agreed leader within {:?}",
            ELECTION_TIMEOUT
        );
        found.unwrap()
    }

    /// Any running node that is not the leader
    pub fn follower_of(&self, leader: u64) -> u64 {
        *self
            .running()
            .map(|(id, _)| id)
            .find(|id| **id != leader)
            .unwrap()
    }

    /// Wait until every node in `ids` has applied `key = value`
    pub fn wait_value(&self, ids: &[u64], key: &str, value: &str) -> bool {
        wait_until(CONVERGE_TIMEOUT, || {
            ids.iter()
                .all(|id| self.node(*id).get(key).as_deref() == Some(value))
        })
    }

    /// On-disk directory of node `id`
    pub fn node_dir(&self, id: u64) -> PathBuf {
        self.data_dir.path().join(format!("node-{}", id))
    }

    pub fn ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for replica in self.nodes.values() {
            let _ = replica.shutdown();
        }
    }
}
