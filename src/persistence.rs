//! Snapshot persistence for crash recovery.
//!
//! Saves are triggered three ways: a debounced timer armed by document change
//! events, an explicit manual request, and a best-effort attempt at session
//! teardown. A failed save is logged and retried at the next debounce window;
//! it never blocks editing. Loading happens once at session start, before the
//! transport is ready for local edits.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document::{Document, RoomId, StoreError};

/// Minimum spacing between debounce-triggered saves.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored snapshot for room {0} is corrupt: {1}")]
    Corrupt(RoomId, String),
}

/// Durable storage for room snapshots, keyed by room id and unversioned:
/// each put overwrites the previous snapshot.
pub trait SnapshotStore {
    fn put(&mut self, room: RoomId, bytes: &[u8]) -> Result<(), PersistError>;
    fn get(&self, room: RoomId) -> Result<Option<Vec<u8>>, PersistError>;
}

/// Get the default storage directory for room snapshots.
pub fn default_storage_dir() -> PathBuf {
    // Use XDG data directory if available, otherwise fallback to ~/.local/share
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("canvasync")
}

/// Filesystem-backed snapshot store: one file per room.
pub struct FsSnapshotStore {
    dir: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, room: RoomId) -> PathBuf {
        self.dir.join(format!("{room}.snapshot"))
    }
}

impl Default for FsSnapshotStore {
    fn default() -> Self {
        Self::new(default_storage_dir())
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn put(&mut self, room: RoomId, bytes: &[u8]) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(room), bytes)?;
        Ok(())
    }

    fn get(&self, room: RoomId) -> Result<Option<Vec<u8>>, PersistError> {
        let path = self.path_for(room);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}

/// In-memory snapshot store, for tests and embedding.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: HashMap<RoomId, Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&mut self, room: RoomId, bytes: &[u8]) -> Result<(), PersistError> {
        self.snapshots.insert(room, bytes.to_vec());
        Ok(())
    }

    fn get(&self, room: RoomId) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.snapshots.get(&room).cloned())
    }
}

/// Drives the save lifecycle for one room's document.
pub struct PersistenceService {
    store: Box<dyn SnapshotStore + Send>,
    debounce: Duration,
    /// Set by document change events; cleared by a successful save.
    dirty: bool,
    /// Last save attempt, success or failure: failures wait out the same
    /// window before retrying.
    last_attempt: Option<Instant>,
    /// Suppresses overlapping triggers while a save runs.
    in_flight: bool,
}

impl PersistenceService {
    pub fn new(store: Box<dyn SnapshotStore + Send>) -> Self {
        Self::with_debounce(store, SAVE_DEBOUNCE)
    }

    pub fn with_debounce(store: Box<dyn SnapshotStore + Send>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            dirty: false,
            last_attempt: None,
            in_flight: false,
        }
    }

    /// Arm the debounce timer; called on every document change event.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Debounced save driver; call from the session poll loop. Saves only if
    /// dirty, outside the debounce window, and no save is in flight.
    pub fn tick(&mut self, doc: &Document, now: Instant) -> bool {
        if !self.dirty || self.in_flight {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.debounce {
                return false;
            }
        }
        self.save(doc, now)
    }

    /// Explicit manual save, bypassing the debounce window.
    pub fn save_now(&mut self, doc: &Document, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        self.save(doc, now)
    }

    /// Best-effort save at session teardown: one attempt, failure only logged.
    pub fn save_on_teardown(&mut self, doc: &Document) {
        if self.in_flight {
            return;
        }
        if !self.save(doc, Instant::now()) {
            warn!(room = %doc.room(), "teardown save did not complete");
        }
    }

    fn save(&mut self, doc: &Document, now: Instant) -> bool {
        self.in_flight = true;
        self.last_attempt = Some(now);
        let bytes = doc.snapshot();
        let result = self.store.put(doc.room(), &bytes);
        self.in_flight = false;

        match result {
            Ok(()) => {
                self.dirty = false;
                debug!(room = %doc.room(), bytes = bytes.len(), "snapshot saved");
                true
            }
            Err(e) => {
                // Stay dirty; the next debounce window retries.
                warn!(room = %doc.room(), error = %e, "snapshot save failed");
                false
            }
        }
    }

    /// Load the latest snapshot and hydrate the document. Returns whether a
    /// snapshot existed. Corruption is surfaced as an explicit error rather
    /// than silently starting from empty state.
    pub fn load(&self, doc: &mut Document) -> Result<bool, PersistError> {
        let room = doc.room();
        let Some(bytes) = self.store.get(room)? else {
            info!(%room, "no stored snapshot; starting fresh");
            return Ok(false);
        };
        match doc.hydrate(&bytes) {
            Ok(()) => {
                info!(%room, objects = doc.len(), "document hydrated from snapshot");
                Ok(true)
            }
            Err(StoreError::CorruptSnapshot(msg)) => Err(PersistError::Corrupt(room, msg)),
            Err(e) => Err(PersistError::Corrupt(room, e.to_string())),
        }
    }
}
