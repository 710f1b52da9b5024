//! Stop, restart, pause and resume tests

use std::thread;
use std::time::Duration;

use quorumkv::config::WalSyncStrategy;
use quorumkv::error::QuorumError;
use quorumkv::storage::RaftStorage;
use quorumkv::NodeState;

use crate::cluster::{wait_until, Cluster, CONVERGE_TIMEOUT};

#[test]
fn test_stop_twice_fails() {
    let cluster = Cluster::new(1);
    cluster.wait_leader();

    cluster.node(1).stop().unwrap();
    assert_eq!(cluster.node(1).status().state, NodeState::Stopped);
    assert!(matches!(
        cluster.node(1).stop(),
        Err(QuorumError::InvalidState(_))
    ));
}

#[test]
fn test_restart_requires_stopped_node() {
    let cluster = Cluster::new(1);
    assert!(matches!(
        cluster.node(1).restart(),
        Err(QuorumError::InvalidState(_))
    ));
}

#[test]
fn test_health_follows_lifecycle() {
    let cluster = Cluster::new(1);
    cluster.wait_leader();
    assert!(cluster.node(1).is_serving());

    cluster.node(1).stop().unwrap();
    assert!(!cluster.node(1).is_serving());

    cluster.node(1).restart().unwrap();
    assert!(cluster.node(1).is_serving());
}

#[test]
fn test_restarted_follower_keeps_and_extends_state() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    cluster.node(leader).set("a", "1").unwrap();
    assert!(cluster.wait_value(&cluster.ids(), "a", "1"));
    let term_before = cluster.node(follower).status().term;

    cluster.node(follower).stop().unwrap();
    cluster.node(leader).set("b", "2").unwrap();

    cluster.node(follower).restart().unwrap();
    assert!(cluster.node(follower).status().term >= term_before);
    assert!(cluster.wait_value(&[follower], "b", "2"));
    assert_eq!(cluster.node(follower).get("a").as_deref(), Some("1"));
}

#[test]
fn test_stop_leaves_exact_hard_state_on_disk() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    for i in 0..10 {
        cluster.node(leader).set(&format!("h{}", i), "x").unwrap();
    }
    assert!(cluster.wait_value(&cluster.ids(), "h9", "x"));

    let live = cluster.node(follower).storage().unwrap();
    cluster.node(follower).stop().unwrap();
    let before = live.hard_state();
    drop(live);
    let status = cluster.node(follower).status();
    assert_eq!(
        (before.term, before.vote, before.commit),
        (status.term, status.vote, status.commit)
    );
    assert!(before.commit >= 13);

    let reopened = RaftStorage::open(&cluster.node_dir(follower), WalSyncStrategy::EveryWrite).unwrap();
    assert_eq!(reopened.hard_state(), before);
    drop(reopened);

    cluster.node(follower).restart().unwrap();
    assert!(cluster.node(follower).status().term >= before.term);
    assert!(cluster.wait_value(&[follower], "h9", "x"));
}

#[test]
fn test_whole_cluster_restart_recovers_from_disk() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    for i in 0..10 {
        cluster.node(leader).set(&format!("d{}", i), "x").unwrap();
    }
    assert!(cluster.wait_value(&cluster.ids(), "d9", "x"));

    for id in cluster.ids() {
        cluster.node(id).stop().unwrap();
    }
    for id in cluster.ids() {
        cluster.node(id).restart().unwrap();
    }

    cluster.wait_leader();
    assert!(cluster.wait_value(&cluster.ids(), "d9", "x"));
    assert_eq!(cluster.node(1).kv().state().len(), 10);
}

#[test]
fn test_paused_follower_resumes_and_catches_up() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    cluster.node(follower).pause().unwrap();
    assert_eq!(cluster.node(follower).status().state, NodeState::Paused);
    assert!(matches!(
        cluster.node(follower).pause(),
        Err(QuorumError::InvalidState(_))
    ));

    cluster.node(leader).set("while-paused", "1").unwrap();
    let active: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != follower).collect();
    assert!(cluster.wait_value(&active, "while-paused", "1"));

    thread::sleep(Duration::from_millis(200));
    assert_eq!(cluster.node(follower).get("while-paused"), None);

    cluster.node(follower).resume().unwrap();
    assert_eq!(cluster.node(follower).status().state, NodeState::Running);
    assert!(cluster.wait_value(&[follower], "while-paused", "1"));
}

#[test]
fn test_pause_resume_applies_every_write_once() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    cluster.node(follower).pause().unwrap();
    for i in 0..25 {
        cluster.node(leader).set(&format!("p{}", i), &i.to_string()).unwrap();
    }
    let active: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != follower).collect();
    assert!(cluster.wait_value(&active, "p24", "24"));

    cluster.node(follower).resume().unwrap();
    for i in 25..50 {
        cluster.node(leader).set(&format!("p{}", i), &i.to_string()).unwrap();
    }

    let kv = cluster.node(follower).kv();
    assert!(wait_until(CONVERGE_TIMEOUT, || kv.state().len() == 50));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(kv.applied_writes(), 50);
    for i in 0..50 {
        assert_eq!(kv.lookup(&format!("p{}", i)), Some(i.to_string()));
    }
}

#[test]
fn test_resume_requires_paused_node() {
    let cluster = Cluster::new(1);
    assert!(matches!(
        cluster.node(1).resume(),
        Err(QuorumError::InvalidState(_))
    ));
}

#[test]
fn test_proposal_after_shutdown_fails() {
    let cluster = Cluster::new(1);
    cluster.wait_leader();

    cluster.node(1).shutdown().unwrap();
    assert!(matches!(
        cluster.node(1).set("k", "v"),
        Err(QuorumError::ProposalClosed)
    ));
}

#[test]
fn test_campaign_on_stopped_node_fails() {
    let cluster = Cluster::new(1);
    cluster.node(1).stop().unwrap();
    assert!(matches!(
        cluster.node(1).campaign(),
        Err(QuorumError::NodeStopped(1))
    ));
}
