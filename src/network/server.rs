//! TCP Server
//!
//! Accepts connections and hands each to its own thread.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::network::Connection;
use crate::protocol::{write_response, Response};
use crate::replica::Replica;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Cloneable trigger that stops a running [`Server`], e.g. from a signal handler
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Make [`Server::run`] return at its next poll
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// TCP server for QuorumKV clients
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    replica: Arc<Replica>,
    max_connections: usize,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listen address from `config`
    pub fn bind(config: &Config, replica: Arc<Replica>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, node = replica.id(), "client service listening");

        Ok(Self {
            listener,
            local_addr,
            replica,
            max_connections: config.max_connections,
            read_timeout_ms: config.read_timeout_ms,
            write_timeout_ms: config.write_timeout_ms,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until [`Server::shutdown`] is called
    pub fn run(&self) -> Result<()> {
        while !self.shutdown.load(Ordering::SeqCst) {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };
            stream.set_nonblocking(false)?;

            if self.active.load(Ordering::SeqCst) >= self.max_connections {
                tracing::warn!("Rejecting {}: connection limit {} reached", peer, self.max_connections);
                let mut stream = stream;
                let _ = write_response(&mut stream, &Response::error("too many connections"));
                continue;
            }

            let mut conn = Connection::new(stream, Arc::clone(&self.replica))?;
            conn.set_timeouts(self.read_timeout_ms, self.write_timeout_ms)?;

            let active = Arc::clone(&self.active);
            active.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name("client-conn".to_string())
                .spawn(move || {
                    if let Err(e) = conn.handle() {
                        tracing::debug!("Connection {} ended with error: {}", conn.peer_addr(), e);
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            if let Err(e) = spawned {
                self.active.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!("Failed to spawn connection thread: {}", e);
            }
        }
        tracing::info!(addr = %self.local_addr, "client service stopped");
        Ok(())
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Handle that can stop the server from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    /// Open connections
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}
