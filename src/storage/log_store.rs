//! Durable raft log
//!
//! [`RaftStorage`] keeps an in-memory mirror of the log for the engine's read
//! path and writes every mutation to the WAL before returning. Clones share
//! the same state, so the driver can hand one clone to the engine and keep
//! another for persistence.
//!
//! ```text
//!           offset                first_index            last_index
//!             │                       │                      │
//!   ...───────┼───────────────────────┼──────────────────────┤
//!   compacted │  (offset_term known)  │ entries[0] ... entries[n-1]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use prost::Message as _;
use raft::prelude::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Snapshot};
use raft::storage::{GetEntriesContext, RaftState, Storage};
use raft::StorageError;

use crate::config::WalSyncStrategy;
use crate::error::{QuorumError, Result};
use crate::storage::Snapshotter;
use crate::wal::{LogRecord, WalRecord, WalRecovery, WalWriter};

const WAL_FILE: &str = "wal.log";
const SNAP_DIR: &str = "snap";

/// Stable storage for one node, shared between the engine and the driver
#[derive(Clone)]
pub struct RaftStorage {
    shared: Arc<Shared>,
}

struct Shared {
    core: RwLock<StorageCore>,
    /// Set when the engine asked for a snapshot we could not serve
    snapshot_requested: AtomicBool,
}

struct StorageCore {
    hard_state: HardState,
    conf_state: ConfState,

    /// Index and term of the entry immediately before `entries[0]`
    offset: u64,
    offset_term: u64,
    entries: Vec<Entry>,

    /// Newest snapshot, empty until one is created or installed
    snapshot: Snapshot,

    wal: WalWriter,
    snapshotter: Snapshotter,
}

impl RaftStorage {
    // =========================================================================
    // Open & Bootstrap
    // =========================================================================

    /// Open the storage in `dir`, replaying the WAL and the newest snapshot
    pub fn open(dir: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE);
        let snapshotter = Snapshotter::open(&dir.join(SNAP_DIR))?;

        let (records, recovery) = if wal_path.exists() {
            WalRecovery::recover(&wal_path)?
        } else {
            (Vec::new(), Default::default())
        };
        if recovery.was_truncated {
            tracing::warn!(dir = %dir.display(), "torn WAL tail discarded during recovery");
        }

        let wal = WalWriter::open(&wal_path, sync_strategy)?;
        let mut core = StorageCore {
            hard_state: HardState::default(),
            conf_state: ConfState::default(),
            offset: 0,
            offset_term: 0,
            entries: Vec::new(),
            snapshot: Snapshot::default(),
            wal,
            snapshotter,
        };

        for record in records {
            core.replay(record)?;
        }

        if let Some(snapshot) = core.snapshotter.load_newest()? {
            core.install_loaded_snapshot(snapshot);
        }

        let last = core.last_index();
        if core.hard_state.commit > last {
            tracing::warn!(
                commit = core.hard_state.commit,
                last_index = last,
                "persisted commit beyond log, clamping"
            );
            core.hard_state.commit = last;
        }

        tracing::info!(
            dir = %dir.display(),
            first_index = core.first_index(),
            last_index = last,
            term = core.hard_state.term,
            commit = core.hard_state.commit,
            snapshot_index = core.snapshot.get_metadata().index,
            "opened raft storage"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                core: RwLock::new(core),
                snapshot_requested: AtomicBool::new(false),
            }),
        })
    }

    /// True if nothing has ever been written (no log, no hard state, no snapshot)
    pub fn is_empty(&self) -> bool {
        let core = self.rl();
        core.entries.is_empty()
            && core.offset == 0
            && core.hard_state == HardState::default()
            && core.snapshot.get_metadata().index == 0
    }

    /// Seed a fresh log with one committed AddNode entry per initial member
    ///
    /// Every initial member writes the identical prefix, so their logs agree
    /// from the first index and a later joiner learns the membership (and
    /// each member's address) by replaying it.
    pub fn bootstrap(&self, peers: &BTreeMap<u64, String>) -> Result<()> {
        if !self.is_empty() {
            return Err(QuorumError::InvalidState(
                "cannot bootstrap non-empty storage".to_string(),
            ));
        }
        if peers.is_empty() {
            return Err(QuorumError::Config("bootstrap needs at least one peer".to_string()));
        }

        let mut entries = Vec::with_capacity(peers.len());
        for (i, (id, addr)) in peers.iter().enumerate() {
            let mut cc = ConfChange::default();
            cc.set_change_type(ConfChangeType::AddNode);
            cc.node_id = *id;
            cc.context = addr.as_bytes().to_vec().into();

            let mut entry = Entry::default();
            entry.set_entry_type(EntryType::EntryConfChange);
            entry.term = 1;
            entry.index = i as u64 + 1;
            entry.data = cc.encode_to_vec().into();
            entries.push(entry);
        }

        let mut hs = HardState::default();
        hs.term = 1;
        hs.commit = peers.len() as u64;

        self.persist(&hs, &entries)?;

        let voters: Vec<u64> = peers.keys().copied().collect();
        tracing::info!(voters = ?voters, "bootstrapped raft log");
        self.wl().conf_state.voters = voters;
        Ok(())
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Persist new entries and a hard-state change in one write
    ///
    /// Either part may be empty. Conflicting suffixes are truncated before
    /// the new entries are appended. A hard-state change is always synced;
    /// entries on their own follow the WAL sync strategy.
    pub fn persist(&self, hard_state: &HardState, entries: &[Entry]) -> Result<()> {
        let mut core = self.wl();
        let hs_changed = *hard_state != HardState::default() && *hard_state != core.hard_state;
        if entries.is_empty() && !hs_changed {
            return Ok(());
        }

        if let Some(first) = entries.first() {
            core.check_append(first.index)?;
        }

        let mut records: Vec<WalRecord> = entries
            .iter()
            .map(|e| WalRecord::Entry(LogRecord::from(e)))
            .collect();
        if hs_changed {
            records.push(WalRecord::hard_state(hard_state));
        }
        if hs_changed {
            core.wal.append_all_synced(&records)?;
        } else {
            core.wal.append_all(&records)?;
        }

        if !entries.is_empty() {
            core.append_in_memory(entries);
        }
        if hs_changed {
            core.hard_state = hard_state.clone();
        }
        Ok(())
    }

    /// Persist a hard-state change on its own
    pub fn set_hard_state(&self, hard_state: &HardState) -> Result<()> {
        self.persist(hard_state, &[])
    }

    /// Record a commit advance reported after the engine's ready was handled
    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.rl().hard_state.clone();
        if commit <= hs.commit {
            return Ok(());
        }
        hs.commit = commit;
        self.set_hard_state(&hs)
    }

    /// Append entries, truncating any conflicting suffix
    ///
    /// Not synced unless the WAL sync strategy says so.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        self.persist(&HardState::default(), entries)
    }

    /// Replace membership in memory (durable through the log and snapshots)
    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.wl().conf_state = conf_state;
    }

    /// Install a snapshot received from the leader
    ///
    /// The whole log is discarded and restarts after the snapshot.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut core = self.wl();
        let meta = snapshot.get_metadata();
        let (index, term) = (meta.index, meta.term);

        if index <= core.snapshot.get_metadata().index {
            return Err(QuorumError::Raft(raft::Error::Store(
                StorageError::SnapshotOutOfDate,
            )));
        }

        core.snapshotter.save(&snapshot)?;

        let mut hs = core.hard_state.clone();
        hs.term = hs.term.max(term);
        hs.commit = hs.commit.max(index);
        core.wal.append_all_synced(&[
            WalRecord::Snapshot { index, term },
            WalRecord::hard_state(&hs),
        ])?;

        core.entries.clear();
        core.offset = index;
        core.offset_term = term;
        core.hard_state = hs;
        core.conf_state = meta.get_conf_state().clone();
        core.snapshot = snapshot;
        self.shared.snapshot_requested.store(false, Ordering::SeqCst);

        tracing::info!(index, term, "installed snapshot from leader");
        Ok(())
    }

    /// Save a snapshot of the state machine as of `index`
    pub fn create_snapshot(&self, index: u64, conf_state: ConfState, data: Vec<u8>) -> Result<Snapshot> {
        let mut core = self.wl();
        let current = core.snapshot.get_metadata().index;
        if index < current {
            return Err(QuorumError::Snapshot(format!(
                "requested index {} is older than snapshot {}",
                index, current
            )));
        }
        if index > core.last_index() {
            return Err(QuorumError::Snapshot(format!(
                "requested index {} is beyond last index {}",
                index,
                core.last_index()
            )));
        }

        let term = core.term(index)?;
        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(conf_state);

        core.snapshotter.save(&snapshot)?;
        core.snapshot = snapshot.clone();
        self.shared.snapshot_requested.store(false, Ordering::SeqCst);

        tracing::info!(index, term, "created snapshot");
        Ok(snapshot)
    }

    /// Drop entries below `compact_index` and rewrite the WAL
    ///
    /// The entry at `compact_index` becomes the first retained entry.
    pub fn compact(&self, compact_index: u64) -> Result<()> {
        let mut core = self.wl();
        if compact_index <= core.first_index() {
            return Ok(());
        }
        if compact_index > core.last_index() + 1 {
            return Err(QuorumError::Storage(format!(
                "compact index {} is beyond last index {}",
                compact_index,
                core.last_index()
            )));
        }

        let new_offset = compact_index - 1;
        let new_offset_term = core.term(new_offset)?;
        let drain = (new_offset - core.offset) as usize;
        core.entries.drain(..drain);
        core.offset = new_offset;
        core.offset_term = new_offset_term;

        let mut records = Vec::with_capacity(core.entries.len() + 2);
        records.push(WalRecord::Snapshot {
            index: new_offset,
            term: new_offset_term,
        });
        records.extend(
            core.entries
                .iter()
                .map(|e| WalRecord::Entry(LogRecord::from(e))),
        );
        records.push(WalRecord::hard_state(&core.hard_state));
        core.wal.rewrite(&records)?;

        tracing::info!(
            compact_index,
            retained = core.entries.len(),
            "compacted raft log"
        );
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn hard_state(&self) -> HardState {
        self.rl().hard_state.clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.rl().conf_state.clone()
    }

    /// Newest snapshot (empty if none)
    pub fn latest_snapshot(&self) -> Snapshot {
        self.rl().snapshot.clone()
    }

    /// Index of the newest snapshot, 0 if none
    pub fn snapshot_index(&self) -> u64 {
        self.rl().snapshot.get_metadata().index
    }

    /// Whether the engine asked for a snapshot that does not exist yet
    pub fn snapshot_requested(&self) -> bool {
        self.shared.snapshot_requested.load(Ordering::SeqCst)
    }

    fn rl(&self) -> RwLockReadGuard<'_, StorageCore> {
        self.shared.core.read()
    }

    fn wl(&self) -> RwLockWriteGuard<'_, StorageCore> {
        self.shared.core.write()
    }
}

// =============================================================================
// Engine Read Contract
// =============================================================================

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.rl();
        Ok(RaftState::new(
            core.hard_state.clone(),
            core.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        let core = self.rl();
        if low <= core.offset {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let lo = (low - core.offset - 1) as usize;
        let hi = (high - core.offset - 1) as usize;
        let mut out = Vec::with_capacity(hi.saturating_sub(lo));
        let mut size = 0u64;
        for entry in &core.entries[lo..hi] {
            size += entry.encoded_len() as u64;
            // Always return at least one entry
            if let Some(limit) = max_size {
                if !out.is_empty() && size > limit {
                    break;
                }
            }
            out.push(entry.clone());
        }
        Ok(out)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.rl();
        core.term(idx).map_err(|_| {
            if idx < core.offset {
                raft::Error::Store(StorageError::Compacted)
            } else {
                raft::Error::Store(StorageError::Unavailable)
            }
        })
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let core = self.rl();
        let meta = core.snapshot.get_metadata();
        let cs = meta.get_conf_state();
        let covers_peer = cs.voters.contains(&to) || cs.learners.contains(&to);

        if meta.index == 0 || meta.index < request_index || !covers_peer {
            self.shared.snapshot_requested.store(true, Ordering::SeqCst);
            tracing::debug!(
                to,
                request_index,
                snapshot_index = meta.index,
                "snapshot not ready, requesting a new one"
            );
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(core.snapshot.clone())
    }
}

// =============================================================================
// In-Memory Mirror
// =============================================================================

impl StorageCore {
    fn first_index(&self) -> u64 {
        self.offset + 1
    }

    fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    fn term(&self, idx: u64) -> Result<u64> {
        if idx == self.offset {
            return Ok(self.offset_term);
        }
        if idx < self.offset || idx > self.last_index() {
            return Err(QuorumError::Storage(format!(
                "index {} outside log [{}, {}]",
                idx,
                self.offset,
                self.last_index()
            )));
        }
        Ok(self.entries[(idx - self.offset - 1) as usize].term)
    }

    fn check_append(&self, first_new: u64) -> Result<()> {
        if first_new <= self.offset {
            return Err(QuorumError::Storage(format!(
                "append at {} would overwrite compacted log (offset {})",
                first_new, self.offset
            )));
        }
        if first_new > self.last_index() + 1 {
            return Err(QuorumError::Storage(format!(
                "append at {} leaves a gap after last index {}",
                first_new,
                self.last_index()
            )));
        }
        Ok(())
    }

    fn append_in_memory(&mut self, entries: &[Entry]) {
        let keep = (entries[0].index - self.offset - 1) as usize;
        self.entries.truncate(keep);
        self.entries.extend_from_slice(entries);
    }

    fn replay(&mut self, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::Entry(log) => {
                if log.index <= self.offset {
                    return Ok(());
                }
                self.check_append(log.index)
                    .map_err(|e| QuorumError::WalCorruption(e.to_string()))?;
                self.append_in_memory(&[log.to_entry()]);
            }
            WalRecord::HardState { term, vote, commit } => {
                self.hard_state.term = term;
                self.hard_state.vote = vote;
                self.hard_state.commit = commit;
            }
            WalRecord::Snapshot { index, term } => {
                self.entries.clear();
                self.offset = index;
                self.offset_term = term;
            }
        }
        Ok(())
    }

    fn install_loaded_snapshot(&mut self, snapshot: Snapshot) {
        let meta = snapshot.get_metadata();
        let (index, term) = (meta.index, meta.term);

        // Snapshot newer than the log: start the log over after it
        if index > self.last_index() {
            self.entries.clear();
            self.offset = index;
            self.offset_term = term;
        }
        if self.hard_state.commit < index {
            self.hard_state.commit = index;
        }
        if self.hard_state.term < term {
            self.hard_state.term = term;
        }
        self.conf_state = meta.get_conf_state().clone();
        self.snapshot = snapshot;
    }
}
