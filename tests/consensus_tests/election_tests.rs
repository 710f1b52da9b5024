//! Leader election tests

use quorumkv::consensus::NodeRole;

use crate::cluster::{wait_until, Cluster, ELECTION_TIMEOUT};

#[test]
fn test_single_node_elects_itself() {
    let cluster = Cluster::new(1);
    assert_eq!(cluster.wait_leader(), 1);

    let status = cluster.node(1).status();
    assert_eq!(status.role, NodeRole::Leader);
    assert!(status.term >= 2);
}

#[test]
fn test_three_nodes_agree_on_one_leader() {
    let cluster = Cluster::new(3);
    let leader = cluster.wait_leader();

    let term = cluster.node(leader).status().term;
    let leaders = cluster
        .ids()
        .into_iter()
        .filter(|id| cluster.node(*id).status().is_leader())
        .count();
    assert_eq!(leaders, 1);
    for id in cluster.ids() {
        let status = cluster.node(id).status();
        assert_eq!(status.leader_id, leader);
        assert!(status.term <= term);
    }
}

#[test]
fn test_isolated_leader_is_replaced() {
    let cluster = Cluster::new(3);
    let old_leader = cluster.wait_leader();
    let old_term = cluster.node(old_leader).status().term;

    cluster.net.isolate(old_leader);

    let others: Vec<u64> = cluster.ids().into_iter().filter(|id| *id != old_leader).collect();
    assert!(
        wait_until(ELECTION_TIMEOUT, || {
            others.iter().any(|id| {
                let status = cluster.node(*id).status();
                status.is_leader() && status.term > old_term
            })
        }),
        "majority side did not elect a new leader"
    );

    cluster.net.heal();

    // The old leader steps down once it hears the higher term
    let leader = cluster.wait_leader();
    assert_ne!(leader, old_leader);
}
