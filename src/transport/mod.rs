//! Transport Module
//!
//! Delivers consensus messages between node identities.
//!
//! ## Architecture
//! ```text
//!   control loop ──► Dispatcher ──(worker pool, random delay)──► Transport::send
//!                                                                   │
//!   control loop ◄── Transport::receive() ◄─────────────── peer inbound
//! ```
//!
//! - [`TcpTransport`]: production transport, length-prefixed frames over TCP
//! - [`SimNetwork`] / [`SimTransport`]: in-process fabric with per-link
//!   drop and delay injection, used by tests
//!
//! Sends are fire-and-forget. A message that cannot be delivered is dropped
//! and the consensus engine's own retransmission covers the loss.

mod dispatch;
mod sim;
mod tcp;

pub use dispatch::Dispatcher;
pub use sim::{LinkFilter, SimNetwork, SimTransport};
pub use tcp::TcpTransport;

use crossbeam::channel::Receiver;
use raft::prelude::Message;

use crate::error::Result;

/// Message delivery between nodes
pub trait Transport: Send + Sync {
    /// Queue a message for its recipient (`msg.to`); never reports failure
    fn send(&self, msg: Message);

    /// Inbound queue for this node
    fn receive(&self) -> Receiver<Message>;

    /// Make this node reachable and able to send
    fn connect(&self) -> Result<()>;

    /// Make this node unreachable; in-flight and future messages are dropped
    fn disconnect(&self);

    /// Learn the address of a node added to the cluster
    fn add_peer(&self, _id: u64, _addr: &str) {}

    /// Forget a node removed from the cluster
    fn remove_peer(&self, _id: u64) {}
}
