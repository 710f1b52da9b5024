//! Snapshot files
//!
//! Each snapshot is a single file named after its term and index. The body is
//! a CRC32 followed by a bincode-encoded image of the snapshot, its metadata
//! and the membership it was taken under.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use raft::prelude::{ConfState, Snapshot};
use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, Result};

/// Number of snapshot files retained after a save
const KEEP_SNAPSHOTS: usize = 2;

const SNAP_SUFFIX: &str = "snap";

/// Reads and writes snapshot files in a directory
pub struct Snapshotter {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    index: u64,
    term: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    voters_outgoing: Vec<u64>,
    learners_next: Vec<u64>,
    auto_leave: bool,
    data: Vec<u8>,
}

impl Snapshotter {
    /// Open (creating if needed) a snapshot directory
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persist a snapshot, then purge all but the newest few
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let meta = snapshot.get_metadata();
        let cs = meta.get_conf_state();
        let file = SnapshotFile {
            index: meta.index,
            term: meta.term,
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
            voters_outgoing: cs.voters_outgoing.clone(),
            learners_next: cs.learners_next.clone(),
            auto_leave: cs.auto_leave,
            data: snapshot.data.to_vec(),
        };
        let body = bincode::serialize(&file)?;
        let crc = crc32fast::hash(&body);

        let path = self.dir.join(format!(
            "{:016x}-{:016x}.{}",
            meta.term, meta.index, SNAP_SUFFIX
        ));
        let temp_path = path.with_extension("tmp");
        {
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            out.write_all(&crc.to_le_bytes())?;
            out.write_all(&body)?;
            out.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        tracing::debug!(index = meta.index, term = meta.term, path = %path.display(), "saved snapshot");

        self.purge()?;
        Ok(path)
    }

    /// Load the newest readable snapshot, skipping damaged files
    pub fn load_newest(&self) -> Result<Option<Snapshot>> {
        for (_, path) in self.list()?.into_iter().rev() {
            match Self::read(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Number of snapshot files on disk
    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Directory holding the snapshot files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(path: &Path) -> Result<Snapshot> {
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        if raw.len() < 4 {
            return Err(QuorumError::Snapshot(format!("{} is truncated", path.display())));
        }
        let crc = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let body = &raw[4..];
        if crc32fast::hash(body) != crc {
            return Err(QuorumError::Snapshot(format!("{} failed crc check", path.display())));
        }
        let file: SnapshotFile = bincode::deserialize(body)?;

        let mut conf_state = ConfState::default();
        conf_state.voters = file.voters;
        conf_state.learners = file.learners;
        conf_state.voters_outgoing = file.voters_outgoing;
        conf_state.learners_next = file.learners_next;
        conf_state.auto_leave = file.auto_leave;

        let mut snapshot = Snapshot::default();
        snapshot.data = file.data.into();
        let meta = snapshot.mut_metadata();
        meta.index = file.index;
        meta.term = file.term;
        meta.set_conf_state(conf_state);
        Ok(snapshot)
    }

    /// Snapshot files sorted by index, oldest first
    fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAP_SUFFIX) {
                continue;
            }
            if let Some(index) = Self::parse_index(&path) {
                found.push((index, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// "0000000000000002-000000000000002a.snap" → Some(42)
    fn parse_index(path: &Path) -> Option<u64> {
        let stem = path.file_stem()?.to_str()?;
        let (_, index) = stem.split_once('-')?;
        u64::from_str_radix(index, 16).ok()
    }

    fn purge(&self) -> Result<()> {
        let files = self.list()?;
        if files.len() <= KEEP_SNAPSHOTS {
            return Ok(());
        }
        for (_, path) in &files[..files.len() - KEEP_SNAPSHOTS] {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
