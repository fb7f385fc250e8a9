//! Last-known-position persistence.
//!
//! The arbitrator records the best fix it has seen so a later session can
//! serve cache-tolerant requests before any provider reports.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use super::position::Position;

/// Key under which the arbitrator persists its best fix.
pub const LAST_POSITION_KEY: &str = "LastPosition";

/// Failure to read or write a store file.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The file could not be read or written.
    #[error("position store io: {0}")]
    Io(#[from] io::Error),

    /// The file contents are not valid position JSON.
    #[error("position store parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Durable name-to-position map.
///
/// Implementations absorb their own failures: `store` reports success as a
/// bool and `retrieve` simply comes back empty.
pub trait PositionStore: Send + Sync {
    fn store(&self, name: &str, position: &Position) -> bool;
    fn retrieve(&self, name: &str) -> Option<Position>;
}

/// Store backed by a single JSON file.
#[derive(Debug)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, Position>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, entries: &HashMap<String, Position>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(entries)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl PositionStore for FilePositionStore {
    fn store(&self, name: &str, position: &Position) -> bool {
        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "position store unreadable, rewriting");
                HashMap::new()
            }
        };
        entries.insert(name.to_string(), position.clone());
        match self.save(&entries) {
            Ok(()) => {
                debug!(path = %self.path.display(), name, "position stored");
                true
            }
            Err(error) => {
                warn!(path = %self.path.display(), %error, "position store write failed");
                false
            }
        }
    }

    fn retrieve(&self, name: &str) -> Option<Position> {
        match self.load() {
            Ok(mut entries) => entries.remove(name),
            Err(error) => {
                debug!(path = %self.path.display(), %error, "position store unreadable");
                None
            }
        }
    }
}

/// In-memory store for tests and embedders without a data directory.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    entries: Mutex<HashMap<String, Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn store(&self, name: &str, position: &Position) -> bool {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), position.clone());
        true
    }

    fn retrieve(&self, name: &str) -> Option<Position> {
        self.entries.lock().unwrap().get(name).cloned()
    }
}
