//! Outbound dispatch pool
//!
//! The control loop hands every outbound message to a bounded queue drained
//! by a fixed set of worker threads. Each worker sleeps a random delay before
//! sending, so per-peer ordering is not preserved. When the queue is full the
//! message is dropped instead of blocking the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Sender, TrySendError};
use rand::Rng;
use raft::prelude::Message;

use crate::config::DispatchConfig;
use crate::transport::Transport;

/// Bounded pool of sender threads
pub struct Dispatcher {
    tx: Option<Sender<Message>>,
    workers: Vec<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Spawn the worker pool for node `id`
    pub fn new(id: u64, config: &DispatchConfig, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = bounded::<Message>(config.max_inflight.max(1));
        let max_delay = config.max_delay;

        let workers = (0..config.workers.max(1))
            .filter_map(|n| {
                let rx = rx.clone();
                let transport = Arc::clone(&transport);
                thread::Builder::new()
                    .name(format!("dispatch-{}-{}", id, n))
                    .spawn(move || {
                        for msg in rx.iter() {
                            let delay = random_delay(max_delay);
                            if !delay.is_zero() {
                                thread::sleep(delay);
                            }
                            transport.send(msg);
                        }
                    })
                    .map_err(|e| tracing::error!(node = id, error = %e, "failed to spawn dispatch worker"))
                    .ok()
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a message without blocking
    pub fn dispatch(&self, msg: Message) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(to = msg.to, "dispatch queue full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting messages and wait for the workers to drain
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn random_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
    Duration::from_micros(micros)
}
