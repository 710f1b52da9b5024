//! Snapshot trigger, compaction and transfer tests

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded};
use quorumkv::config::SnapshotPolicy;
use quorumkv::consensus::{Membership, NodeChannels, SnapshotProvider};
use quorumkv::storage::Snapshotter;
use quorumkv::transport::SimNetwork;
use quorumkv::RaftNode;
use raft::Storage;
use tempfile::TempDir;

use crate::cluster::{node_config, sim_peers, wait_until, Cluster, CONVERGE_TIMEOUT};

fn small_policy(count: u64, catch_up: u64) -> SnapshotPolicy {
    SnapshotPolicy {
        snapshot_count: count,
        catch_up_entries: catch_up,
    }
}

#[test]
fn test_snapshot_waits_for_apply_completion() {
    let temp = TempDir::new().unwrap();
    let net = SimNetwork::new();
    let config = node_config(&temp, 1, sim_peers([1]), false, small_policy(2, 1));

    let (commit_tx, commit_rx) = bounded(0);
    let (propose_tx, propose_rx) = unbounded();
    let (_membership, conf_rx) = Membership::new();
    let (snap_tx, snap_rx) = unbounded();
    let provider: SnapshotProvider = Arc::new(move || {
        let _ = snap_tx.send(());
        Ok(b"image".to_vec())
    });
    let channels = NodeChannels {
        proposals: propose_rx,
        conf_changes: conf_rx,
        commits: commit_tx,
    };
    let mut node = RaftNode::start(config, Arc::new(net.endpoint(1)), channels, provider).unwrap();

    for i in 0..3 {
        propose_tx.send(format!("write{}", i).into_bytes()).unwrap();
    }

    // Apply everything up to the threshold, then hold the batch that crosses it
    let held = loop {
        let batch = commit_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        if batch.index() > 2 {
            break batch;
        }
        batch.complete();
    };

    assert!(
        snap_rx.recv_timeout(Duration::from_millis(300)).is_err(),
        "snapshot taken before the batch was applied"
    );

    held.complete();
    snap_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("snapshot after the batch was applied");

    let storage = node.storage().unwrap();
    assert!(wait_until(Duration::from_secs(5), || storage.snapshot_index() > 2));
    assert_eq!(&storage.latest_snapshot().data[..], b"image");

    // Keep draining so the loop is never parked on the rendezvous
    let drain = std::thread::spawn(move || while commit_rx.recv().is_ok() {});
    node.stop().unwrap();
    drop(node);
    drain.join().unwrap();
}

#[test]
fn test_snapshot_compacts_log_and_restart_restores_state() {
    let cluster = Cluster::with_policy(1, small_policy(5, 2));
    cluster.wait_leader();
    let node = cluster.node(1);

    for i in 0..30 {
        node.set(&format!("k{}", i), &i.to_string()).unwrap();
    }
    assert!(cluster.wait_value(&[1], "k29", "29"));

    let storage = node.storage().unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        storage.snapshot_index() > 0 && storage.first_index().unwrap() > 1
    }));

    let snapshots = Snapshotter::open(&cluster.node_dir(1).join("snap")).unwrap();
    assert!(snapshots.count().unwrap() >= 1);
    assert!(snapshots.count().unwrap() <= 2);

    node.stop().unwrap();
    drop(storage);
    node.restart().unwrap();

    let kv = node.kv().state();
    assert!(wait_until(CONVERGE_TIMEOUT, || kv.len() == 30));
    assert_eq!(node.get("k0").as_deref(), Some("0"));
    assert_eq!(node.get("k29").as_deref(), Some("29"));
}

#[test]
fn test_lagging_follower_catches_up_by_snapshot() {
    let cluster = Cluster::with_policy(3, small_policy(10, 5));
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    cluster.net.isolate(follower);
    for i in 0..60 {
        cluster
            .node(leader)
            .set(&format!("k{}", i), &i.to_string())
            .unwrap();
    }
    let majority: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != follower).collect();
    assert!(cluster.wait_value(&majority, "k59", "59"));

    // The follower's next entry has been compacted away on the leader
    let leader_storage = cluster.node(leader).storage().unwrap();
    let follower_last = cluster.node(follower).storage().unwrap().last_index().unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        leader_storage.first_index().unwrap() > follower_last + 1
    }));

    cluster.net.heal();
    assert!(cluster.wait_value(&[follower], "k59", "59"));
    assert_eq!(cluster.node(follower).get("k0").as_deref(), Some("0"));
    assert!(cluster.node(follower).storage().unwrap().snapshot_index() > 0);
}

#[test]
fn test_joiner_after_compaction_learns_member_addresses() {
    let mut cluster = Cluster::with_policy(3, small_policy(10, 5));
    let leader = cluster.wait_leader();

    for i in 0..30 {
        cluster.node(leader).set(&format!("a{}", i), "x").unwrap();
    }
    cluster.node(leader).add_node(4, "sim-4").unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        cluster.node(leader).membership().contains(4)
    }));
    for i in 0..30 {
        cluster.node(leader).set(&format!("b{}", i), "y").unwrap();
    }
    assert!(cluster.wait_value(&[1, 2, 3], "b29", "y"));

    // The log the joiner needs from the start is gone
    let leader_storage = cluster.node(leader).storage().unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        leader_storage.first_index().unwrap() > 1
    }));

    cluster.start_node(4, true);
    assert!(cluster.wait_value(&[4], "b29", "y"));
    assert!(cluster.node(4).storage().unwrap().snapshot_index() > 0);
    assert_eq!(cluster.node(4).get("a0").as_deref(), Some("x"));
    assert_eq!(cluster.node(4).membership().members(), sim_peers(1..=4));
}
