//! Membership change tests

use quorumkv::error::QuorumError;
use quorumkv::NodeState;

use crate::cluster::{wait_until, Cluster, CONVERGE_TIMEOUT};

#[test]
fn test_add_node_joins_and_catches_up() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.wait_leader();

    cluster.node(leader).set("before-join", "1").unwrap();
    cluster.node(leader).add_node(4, "sim-4").unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        cluster.node(leader).membership().contains(4)
    }));

    cluster.start_node(4, true);
    cluster.node(leader).set("after-join", "2").unwrap();

    assert!(cluster.wait_value(&[1, 2, 3, 4], "after-join", "2"));
    assert_eq!(cluster.node(4).get("before-join").as_deref(), Some("1"));

    // The joiner learned every member, and where to reach it, from the log
    let members = cluster.node(4).membership().members();
    assert_eq!(members.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(members[&4], "sim-4");
}

#[test]
fn test_remove_follower() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();
    let follower = cluster.follower_of(leader);

    cluster.node(leader).remove_node(follower).unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        !cluster.node(leader).membership().contains(follower)
    }));

    let remaining: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != follower).collect();
    cluster.node(leader).set("two-node", "ok").unwrap();
    assert!(cluster.wait_value(&remaining, "two-node", "ok"));
}

#[test]
fn test_removed_leader_stops_and_cluster_continues() {
    let cluster = Cluster::new(3);
    let old_leader = cluster.wait_leader();

    cluster.node(old_leader).remove_node(old_leader).unwrap();

    assert!(wait_until(CONVERGE_TIMEOUT, || {
        cluster.node(old_leader).status().state == NodeState::Stopped
    }));
    assert!(!cluster.node(old_leader).is_serving());

    let new_leader = cluster.wait_leader();
    assert_ne!(new_leader, old_leader);

    let remaining: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != old_leader).collect();
    cluster.node(new_leader).set("after-removal", "yes").unwrap();
    assert!(cluster.wait_value(&remaining, "after-removal", "yes"));
    for id in &remaining {
        assert!(!cluster.node(*id).membership().contains(old_leader));
    }
}

#[test]
fn test_self_removed_node_reports_stopped_consistently() {
    let cluster = Cluster::new(3);
    let old_leader = cluster.wait_leader();

    cluster.node(old_leader).remove_node(old_leader).unwrap();
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        cluster.node(old_leader).status().state == NodeState::Stopped
    }));

    // Stopped for every operation, not only for status
    assert!(matches!(
        cluster.node(old_leader).stop(),
        Err(QuorumError::InvalidState(_))
    ));
    cluster.node(old_leader).restart().unwrap();

    // Replaying its own removal takes it down again
    assert!(wait_until(CONVERGE_TIMEOUT, || {
        cluster.node(old_leader).status().state == NodeState::Stopped
    }));
}
