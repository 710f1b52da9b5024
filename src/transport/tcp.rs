//! TCP transport
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │   prost-encoded Message     │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! One accept thread per transport, one reader thread per inbound
//! connection. Outbound connections are cached per peer and dropped on the
//! first write error; the next send reconnects.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use prost::Message as _;
use raft::prelude::Message;

use crate::error::{QuorumError, Result};
use crate::transport::Transport;

/// Header: kind (1) + len (4)
const FRAME_HEADER: usize = 5;

/// Frame kind for a consensus message
const KIND_RAFT: u8 = 0x01;

/// Largest accepted frame body (64 MB, snapshots travel inline)
const MAX_FRAME: u32 = 64 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Real transport over TCP
pub struct TcpTransport {
    id: u64,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<u64, Arc<PeerLink>>>,
    inbound_tx: Sender<Message>,
    inbound_rx: Receiver<Message>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

struct PeerLink {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl PeerLink {
    fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            stream: Mutex::new(None),
        })
    }
}

impl TcpTransport {
    /// Bind the listener and start accepting peer connections
    ///
    /// The transport starts disconnected; inbound frames are dropped until
    /// [`Transport::connect`] is called.
    pub fn bind(id: u64, listen_addr: &str, peers: &BTreeMap<u64, String>) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = unbounded();
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let peers = peers
            .iter()
            .filter(|(peer, _)| **peer != id)
            .map(|(peer, addr)| (*peer, PeerLink::new(addr)))
            .collect();

        {
            let tx = inbound_tx.clone();
            let connected = Arc::clone(&connected);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("raft-accept-{}", id))
                .spawn(move || accept_loop(id, listener, tx, connected, shutdown))?;
        }

        tracing::info!(node = id, addr = %local_addr, "raft transport listening");

        Ok(Self {
            id,
            local_addr,
            peers: RwLock::new(peers),
            inbound_tx,
            inbound_rx,
            connected,
            shutdown,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_frame(&self, link: &PeerLink, frame: &[u8]) -> io::Result<()> {
        let mut slot = link.stream.lock();
        if slot.is_none() {
            *slot = Some(dial(&link.addr)?);
        }
        let result = match slot.as_mut() {
            Some(stream) => stream.write_all(frame),
            None => Ok(()),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }
}

impl Transport for TcpTransport {
    fn send(&self, msg: Message) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if msg.to == self.id {
            let _ = self.inbound_tx.send(msg);
            return;
        }

        let Some(link) = self.peers.read().get(&msg.to).cloned() else {
            tracing::debug!(node = self.id, to = msg.to, "no address for peer, dropping message");
            return;
        };

        let frame = encode_frame(&msg);
        if let Err(e) = self.send_frame(&link, &frame) {
            tracing::debug!(
                node = self.id,
                to = msg.to,
                addr = %link.addr,
                error = %e,
                "send failed, dropping message"
            );
        }
    }

    fn receive(&self) -> Receiver<Message> {
        self.inbound_rx.clone()
    }

    fn connect(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(QuorumError::Network("transport is shut down".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for link in self.peers.read().values() {
            link.stream.lock().take();
        }
    }

    fn add_peer(&self, id: u64, addr: &str) {
        if id == self.id || addr.is_empty() {
            return;
        }
        tracing::info!(node = self.id, peer = id, addr, "adding peer");
        self.peers.write().insert(id, PeerLink::new(addr));
    }

    fn remove_peer(&self, id: u64) {
        if self.peers.write().remove(&id).is_some() {
            tracing::info!(node = self.id, peer = id, "removed peer");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.disconnect();
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Encode a message into a complete frame
pub(crate) fn encode_frame(msg: &Message) -> BytesMut {
    let body = msg.encode_to_vec();
    let mut frame = BytesMut::with_capacity(FRAME_HEADER + body.len());
    frame.put_u8(KIND_RAFT);
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    frame
}

/// Read one frame; `Ok(None)` on clean EOF
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; FRAME_HEADER];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if kind != KIND_RAFT {
        return Err(QuorumError::Protocol(format!("unknown frame kind 0x{:02x}", kind)));
    }
    if len > MAX_FRAME {
        return Err(QuorumError::Protocol(format!(
            "frame of {} bytes exceeds max {}",
            len, MAX_FRAME
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(Message::decode(body.as_slice())?))
}

fn dial(addr: &str) -> io::Result<TcpStream> {
    let target = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable address"))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(stream)
}

// =============================================================================
// Inbound
// =============================================================================

fn accept_loop(
    id: u64,
    listener: TcpListener,
    tx: Sender<Message>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let tx = tx.clone();
                let connected = Arc::clone(&connected);
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("raft-read-{}", id))
                    .spawn(move || {
                        if let Err(e) = read_loop(stream, tx, connected, shutdown) {
                            tracing::debug!(node = id, peer = %peer, error = %e, "peer connection closed");
                        }
                    });
                if let Err(e) = spawned {
                    tracing::warn!(node = id, error = %e, "failed to spawn reader");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(node = id, error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!(node = id, "raft listener stopped");
}

fn read_loop(
    stream: TcpStream,
    tx: Sender<Message>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = io::BufReader::new(stream);

    while let Some(msg) = read_frame(&mut reader)? {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if !connected.load(Ordering::SeqCst) {
            continue;
        }
        if tx.send(msg).is_err() {
            break;
        }
    }
    Ok(())
}
