//! Network Module
//!
//! Client-facing TCP service.
//!
//! ## Architecture
//! - Single acceptor thread
//! - One thread per connection, capped by `max_connections`
//! - Commands routed to the local [`Replica`](crate::replica::Replica)

mod client;
mod connection;
mod server;

pub use client::Client;
pub use connection::Connection;
pub use server::{Server, ShutdownHandle};
