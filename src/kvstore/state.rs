//! Applied key/value state

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Snapshot image: the applied map and the member addresses known at the
/// same index
#[derive(Serialize)]
struct ImageRef<'a> {
    data: &'a BTreeMap<String, String>,
    members: &'a BTreeMap<u64, String>,
}

#[derive(Default, Deserialize)]
struct Image {
    data: BTreeMap<String, String>,
    members: BTreeMap<u64, String>,
}

/// The applied mapping plus apply-cursor bookkeeping
#[derive(Default)]
pub struct KvState {
    data: RwLock<BTreeMap<String, String>>,
    applied_index: AtomicU64,
    applied_writes: AtomicU64,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value most recently applied for `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    /// Upsert a committed write at `index`
    pub fn put(&self, key: String, value: String, index: u64) {
        self.data.write().insert(key, value);
        self.applied_writes.fetch_add(1, Ordering::SeqCst);
        self.advance(index);
    }

    /// Move the apply cursor without touching the map
    pub fn advance(&self, index: u64) {
        self.applied_index.fetch_max(index, Ordering::SeqCst);
    }

    /// Encode the whole map together with the current member addresses
    pub fn snapshot(&self, members: &BTreeMap<u64, String>) -> Result<Vec<u8>> {
        let data = self.data.read();
        Ok(bincode::serialize(&ImageRef {
            data: &*data,
            members,
        })?)
    }

    /// Replace the whole map with a snapshot image taken at `index`
    ///
    /// Returns the member addresses carried by the image. An empty image
    /// means an empty map and no members. A bad image leaves the state as is.
    pub fn restore(&self, image: &[u8], index: u64) -> Result<BTreeMap<u64, String>> {
        let image: Image = if image.is_empty() {
            Image::default()
        } else {
            bincode::deserialize(image)?
        };
        *self.data.write() = image.data;
        self.applied_index.store(index, Ordering::SeqCst);
        Ok(image.members)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Writes applied since this process started
    pub fn applied_writes(&self) -> u64 {
        self.applied_writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the full map
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }
}
