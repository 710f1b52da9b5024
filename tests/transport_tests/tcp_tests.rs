//! Tests for the TCP peer transport

use std::collections::BTreeMap;
use std::time::Duration;

use quorumkv::transport::{TcpTransport, Transport};
use raft::prelude::{Message, MessageType};

fn message(from: u64, to: u64, term: u64) -> Message {
    let mut msg = Message::default();
    msg.set_msg_type(MessageType::MsgHeartbeat);
    msg.from = from;
    msg.to = to;
    msg.term = term;
    msg
}

/// Two transports on ephemeral ports that know each other's address
fn pair() -> (TcpTransport, TcpTransport) {
    let a = TcpTransport::bind(1, "127.0.0.1:0", &BTreeMap::new()).unwrap();
    let b = TcpTransport::bind(2, "127.0.0.1:0", &BTreeMap::new()).unwrap();
    a.add_peer(2, &b.local_addr().to_string());
    b.add_peer(1, &a.local_addr().to_string());
    a.connect().unwrap();
    b.connect().unwrap();
    (a, b)
}

#[test]
fn test_messages_arrive_in_order() {
    let (a, b) = pair();
    let inbox = b.receive();

    for term in 1..=20 {
        a.send(message(1, 2, term));
    }

    for term in 1..=20 {
        let msg = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.from, 1);
        assert_eq!(msg.to, 2);
        assert_eq!(msg.term, term);
        assert_eq!(msg.get_msg_type(), MessageType::MsgHeartbeat);
    }
}

#[test]
fn test_both_directions() {
    let (a, b) = pair();
    a.send(message(1, 2, 3));
    b.send(message(2, 1, 4));

    assert_eq!(b.receive().recv_timeout(Duration::from_secs(5)).unwrap().term, 3);
    assert_eq!(a.receive().recv_timeout(Duration::from_secs(5)).unwrap().term, 4);
}

#[test]
fn test_self_addressed_message_loops_back() {
    let a = TcpTransport::bind(1, "127.0.0.1:0", &BTreeMap::new()).unwrap();
    a.connect().unwrap();
    a.send(message(1, 1, 9));
    assert_eq!(a.receive().recv_timeout(Duration::from_secs(1)).unwrap().term, 9);
}

#[test]
fn test_unknown_peer_is_dropped_silently() {
    let a = TcpTransport::bind(1, "127.0.0.1:0", &BTreeMap::new()).unwrap();
    a.connect().unwrap();
    a.send(message(1, 42, 1));
    assert!(a.receive().try_recv().is_err());
}

#[test]
fn test_unreachable_peer_does_not_block_forever() {
    let peers = BTreeMap::from([(2, "127.0.0.1:1".to_string())]);
    let a = TcpTransport::bind(1, "127.0.0.1:0", &peers).unwrap();
    a.connect().unwrap();
    // Connection refused: dropped, the call returns
    a.send(message(1, 2, 1));
}

#[test]
fn test_disconnected_transport_neither_sends_nor_receives() {
    let (a, b) = pair();
    let inbox = b.receive();

    b.disconnect();
    a.send(message(1, 2, 1));
    assert!(inbox.recv_timeout(Duration::from_millis(300)).is_err());

    b.connect().unwrap();
    a.send(message(1, 2, 2));
    let msg = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(msg.term, 2);
}

#[test]
fn test_removed_peer_is_no_longer_reached() {
    let (a, b) = pair();
    let inbox = b.receive();

    a.remove_peer(2);
    a.send(message(1, 2, 1));
    assert!(inbox.recv_timeout(Duration::from_millis(300)).is_err());
}
