//! Counter store
//!
//! Aggregates key-down events into per-key and total counts and checkpoints
//! them to a JSON file. Checkpoints are written to a temporary file in the
//! same directory, fsynced, then renamed over the previous file, so a crash
//! at any point leaves either the old or the new checkpoint on disk.
//!
//! Only the counter consumer task calls [`CounterStore::record`]. Snapshots
//! and checkpoints take the same mutex for the duration of a map clone.

use crate::error::PersistError;
use crate::event::KeyEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Format version written into every checkpoint
pub const STATE_VERSION: u32 = 1;

/// In-memory counts. `total` always equals the sum of `counts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterRecord {
    counts: BTreeMap<u16, u64>,
    total: u64,
}

impl CounterRecord {
    /// Build a record from per-key counts, deriving the total
    pub fn from_counts(counts: BTreeMap<u16, u64>) -> Self {
        let total = counts.values().sum();
        Self { counts, total }
    }

    pub fn increment(&mut self, code: u16) {
        *self.counts.entry(code).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn count(&self, code: u16) -> u64 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<u16, u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// On-disk checkpoint
///
/// Unknown fields are ignored on load. A missing version is read as the
/// current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub counts: BTreeMap<u16, u64>,
    pub total: u64,
    pub sequence: u64,
    pub checkpointed_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl PersistedState {
    /// Reject checkpoints from an unknown format version or whose total
    /// disagrees with their per-key counts
    fn validate(&self) -> Result<(), String> {
        if self.version == 0 || self.version > STATE_VERSION {
            return Err(format!("unsupported format version {}", self.version));
        }
        let sum: u64 = self.counts.values().sum();
        if sum != self.total {
            return Err(format!("total {} does not match per-key sum {}", self.total, sum));
        }
        Ok(())
    }
}

/// Immutable copy of the counts handed to reporting code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub counts: BTreeMap<u16, u64>,
    pub total: u64,
    /// Sequence number of the last successful checkpoint (0 = none yet)
    pub sequence: u64,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

struct Inner {
    record: CounterRecord,
    sequence: u64,
    last_checkpoint: Option<DateTime<Utc>>,
    /// Bumped on every recorded event
    generation: u64,
    /// Generation captured by the last successful checkpoint
    persisted_generation: u64,
}

/// Durable per-key keystroke counters
pub struct CounterStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    /// Serializes checkpoint writers so sequence order matches file order
    checkpoint_lock: Mutex<()>,
}

impl CounterStore {
    /// Empty store backed by `path`; nothing is read until [`load`](Self::load)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner {
                record: CounterRecord::default(),
                sequence: 0,
                last_checkpoint: None,
                generation: 0,
                persisted_generation: 0,
            }),
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// Open the store at `path`, loading the last checkpoint unless `reset`
    pub fn open(path: impl Into<PathBuf>, reset: bool) -> Self {
        let store = Self::new(path);
        store.load(reset);
        store
    }

    /// Replace the in-memory counts with the last valid checkpoint.
    ///
    /// Returns false when starting from zero (reset, no file, or a corrupt
    /// file).
    pub fn load(&self, reset: bool) -> bool {
        let loaded = if reset {
            tracing::info!("Counter reset requested, ignoring {:?}", self.path);
            None
        } else {
            load_state(&self.path)
        };

        let mut inner = self.lock();
        // A reset must still overwrite the old file even if nothing is pressed
        inner.generation = u64::from(reset);
        inner.persisted_generation = 0;
        match loaded {
            Some(state) => {
                tracing::info!(
                    "Loaded {} keystrokes across {} keys from {:?} (checkpoint #{})",
                    state.total,
                    state.counts.len(),
                    self.path,
                    state.sequence
                );
                inner.record = CounterRecord::from_counts(state.counts);
                inner.sequence = state.sequence;
                inner.last_checkpoint = Some(state.checkpointed_at);
                true
            }
            None => {
                inner.record = CounterRecord::default();
                inner.sequence = 0;
                inner.last_checkpoint = None;
                false
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count a key event. Only key-down transitions are counted.
    pub fn record(&self, event: &KeyEvent) -> bool {
        if !event.is_down() {
            return false;
        }
        let mut inner = self.lock();
        inner.record.increment(event.code);
        inner.generation += 1;
        true
    }

    /// Copy of the current counts
    pub fn snapshot(&self) -> CounterSnapshot {
        let inner = self.lock();
        CounterSnapshot {
            counts: inner.record.counts().clone(),
            total: inner.record.total(),
            sequence: inner.sequence,
            last_checkpoint: inner.last_checkpoint,
        }
    }

    /// Whether events were recorded since the last successful checkpoint
    pub fn is_dirty(&self) -> bool {
        let inner = self.lock();
        inner.generation != inner.persisted_generation
    }

    /// Durably write the current counts, returning the committed state.
    ///
    /// On failure the previous checkpoint file is left untouched and the
    /// in-memory sequence is not advanced.
    pub fn checkpoint(&self) -> Result<PersistedState, PersistError> {
        let _writer = self
            .checkpoint_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let (state, generation) = {
            let inner = self.lock();
            let state = PersistedState {
                version: STATE_VERSION,
                counts: inner.record.counts().clone(),
                total: inner.record.total(),
                sequence: inner.sequence + 1,
                checkpointed_at: Utc::now(),
            };
            (state, inner.generation)
        };

        let bytes = serde_json::to_vec_pretty(&state)?;
        write_atomic(&self.path, &bytes).map_err(|e| PersistError::Write(self.path.clone(), e))?;

        let mut inner = self.lock();
        inner.sequence = state.sequence;
        inner.last_checkpoint = Some(state.checkpointed_at);
        inner.persisted_generation = generation;
        drop(inner);

        tracing::debug!(
            "Checkpoint #{} written: {} keystrokes",
            state.sequence,
            state.total
        );
        Ok(state)
    }
}

/// Read and validate a checkpoint file
pub fn read_state(path: &Path) -> Result<PersistedState, PersistError> {
    let bytes = std::fs::read(path).map_err(|e| PersistError::Read(path.to_path_buf(), e))?;
    let state: PersistedState = serde_json::from_slice(&bytes)
        .map_err(|e| PersistError::Corrupt(path.to_path_buf(), e.to_string()))?;
    state
        .validate()
        .map_err(|reason| PersistError::Corrupt(path.to_path_buf(), reason))?;
    Ok(state)
}

/// Load the last checkpoint, treating anything unreadable as "no prior state"
pub fn load_state(path: &Path) -> Option<PersistedState> {
    match read_state(path) {
        Ok(state) => Some(state),
        Err(PersistError::Read(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No counter file at {:?}, starting from zero", path);
            None
        }
        Err(e) => {
            tracing::warn!("{}; starting from zero", e);
            None
        }
    }
}

/// Replace `path` with `bytes` via temp file, fsync and rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".keytally-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable
    if let Ok(dir) = File::open(dir) {
        if let Err(e) = dir.sync_all() {
            tracing::trace!("Directory fsync failed for {:?}: {}", path, e);
        }
    }
    Ok(())
}
