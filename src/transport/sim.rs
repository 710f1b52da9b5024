//! Simulated network
//!
//! An in-process routing fabric for tests. Every node gets a [`SimTransport`]
//! endpoint from a shared [`SimNetwork`]. Faults are injected per directed
//! link:
//!
//! ```text
//!   node 1 ──(drop 0.0, delay 0ms)──► node 2
//!   node 2 ──(drop 1.0)────────────X  node 1     asymmetric partition
//! ```
//!
//! Delayed messages are held by a single delivery thread ordered by due time.
//! Visibility is re-checked at delivery, so a node that disconnects while a
//! message is in flight never sees it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use rand::Rng;
use raft::prelude::Message;

use crate::error::Result;
use crate::transport::Transport;

/// Fault filter for one directed link
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkFilter {
    /// Probability of dropping a message (0.0 - 1.0)
    pub drop_rate: f64,
    /// Fixed latency added to each message
    pub delay: Duration,
}

impl LinkFilter {
    /// A link that drops everything
    pub fn blocked() -> Self {
        Self {
            drop_rate: 1.0,
            delay: Duration::ZERO,
        }
    }

    /// A link that delivers everything after `delay`
    pub fn delayed(delay: Duration) -> Self {
        Self {
            drop_rate: 0.0,
            delay,
        }
    }
}

/// State shared with the delivery thread
struct Fabric {
    inboxes: RwLock<HashMap<u64, Sender<Message>>>,
    visible: RwLock<HashSet<u64>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Fabric {
    fn deliver(&self, msg: Message) {
        let reachable = {
            let visible = self.visible.read();
            visible.contains(&msg.to) && visible.contains(&msg.from)
        };
        if !reachable {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let inbox = self.inboxes.read().get(&msg.to).cloned();
        match inbox {
            Some(tx) if tx.send(msg).is_ok() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

struct Delayed {
    due: Instant,
    seq: u64,
    msg: Message,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Shared in-process network
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<SimInner>,
}

struct SimInner {
    fabric: Arc<Fabric>,
    links: RwLock<HashMap<(u64, u64), LinkFilter>>,
    delay_tx: Sender<Delayed>,
    seq: AtomicU64,
    sent: AtomicU64,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    /// Create an empty network and its delivery thread
    pub fn new() -> Self {
        let fabric = Arc::new(Fabric {
            inboxes: RwLock::new(HashMap::new()),
            visible: RwLock::new(HashSet::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let (delay_tx, delay_rx) = unbounded::<Delayed>();

        let worker_fabric = Arc::clone(&fabric);
        let spawned = thread::Builder::new()
            .name("sim-network".to_string())
            .spawn(move || delivery_loop(worker_fabric, delay_rx));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn sim delivery thread");
        }

        Self {
            inner: Arc::new(SimInner {
                fabric,
                links: RwLock::new(HashMap::new()),
                delay_tx,
                seq: AtomicU64::new(0),
                sent: AtomicU64::new(0),
            }),
        }
    }

    /// Endpoint for node `id`; replaces any earlier endpoint's inbox
    pub fn endpoint(&self, id: u64) -> SimTransport {
        let (tx, rx) = unbounded();
        self.inner.fabric.inboxes.write().insert(id, tx);
        SimTransport {
            id,
            net: self.clone(),
            rx,
        }
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Set the filter on the directed link `from → to`
    pub fn set_link(&self, from: u64, to: u64, filter: LinkFilter) {
        self.inner.links.write().insert((from, to), filter);
    }

    /// Apply a filter to both directions between `a` and `b`
    pub fn set_link_both(&self, a: u64, b: u64, filter: LinkFilter) {
        let mut links = self.inner.links.write();
        links.insert((a, b), filter);
        links.insert((b, a), filter);
    }

    /// Block all traffic between the two groups
    pub fn partition(&self, left: &[u64], right: &[u64]) {
        for &a in left {
            for &b in right {
                self.set_link_both(a, b, LinkFilter::blocked());
            }
        }
    }

    /// Block all traffic between `id` and every other known node
    pub fn isolate(&self, id: u64) {
        let others: Vec<u64> = self
            .inner
            .fabric
            .inboxes
            .read()
            .keys()
            .copied()
            .filter(|other| *other != id)
            .collect();
        self.partition(&[id], &others);
    }

    /// Remove every link filter
    pub fn heal(&self) {
        self.inner.links.write().clear();
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Messages handed to the network
    pub fn sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Messages placed in a recipient's inbox
    pub fn delivered(&self) -> u64 {
        self.inner.fabric.delivered.load(Ordering::Relaxed)
    }

    /// Messages lost to filters or invisibility
    pub fn dropped(&self) -> u64 {
        self.inner.fabric.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, msg: Message) {
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        let fabric = &self.inner.fabric;

        let filter = self
            .inner
            .links
            .read()
            .get(&(msg.from, msg.to))
            .copied()
            .unwrap_or_default();

        if filter.drop_rate > 0.0 && rand::thread_rng().gen::<f64>() < filter.drop_rate {
            fabric.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if filter.delay.is_zero() {
            fabric.deliver(msg);
            return;
        }

        let delayed = Delayed {
            due: Instant::now() + filter.delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            msg,
        };
        if self.inner.delay_tx.send(delayed).is_err() {
            fabric.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn delivery_loop(fabric: Arc<Fabric>, rx: Receiver<Delayed>) {
    let mut pending: BinaryHeap<Reverse<Delayed>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while pending.peek().map_or(false, |Reverse(d)| d.due <= now) {
            if let Some(Reverse(d)) = pending.pop() {
                fabric.deliver(d.msg);
            }
        }

        let wait = pending
            .peek()
            .map(|Reverse(d)| d.due.saturating_duration_since(now))
            .unwrap_or(Duration::from_millis(100));

        match rx.recv_timeout(wait) {
            Ok(d) => pending.push(Reverse(d)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// One node's view of a [`SimNetwork`]
pub struct SimTransport {
    id: u64,
    net: SimNetwork,
    rx: Receiver<Message>,
}

impl SimTransport {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Transport for SimTransport {
    fn send(&self, mut msg: Message) {
        msg.from = self.id;
        self.net.route(msg);
    }

    fn receive(&self) -> Receiver<Message> {
        self.rx.clone()
    }

    fn connect(&self) -> Result<()> {
        self.net.inner.fabric.visible.write().insert(self.id);
        Ok(())
    }

    fn disconnect(&self) {
        self.net.inner.fabric.visible.write().remove(&self.id);
    }
}
