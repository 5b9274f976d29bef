//! Durable persistence for the consensus state.
//!
//! The durable record is everything a node must recover after a crash:
//! current term, vote, the log suffix since the last snapshot, and the
//! snapshot marker, plus the opaque snapshot bytes themselves.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::raft::log::LogEntry;
use crate::raft::{LogIndex, NodeId, Term};

/// The state that must survive restart, written before any RPC reply that
/// depends on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub snapshot_index: LogIndex,
    pub snapshot_term: Term,
    pub entries: Vec<LogEntry>,
}

/// Abstraction over the durable store.
///
/// Implementations must make `save` atomic with respect to crashes: after a
/// restart, `load` returns either the previous record or the new one, never
/// a torn mix.
pub trait Storage: Send {
    fn save(&mut self, state: &HardState) -> io::Result<()>;

    /// Persist the record together with new snapshot bytes.
    fn save_with_snapshot(&mut self, state: &HardState, snapshot: &[u8]) -> io::Result<()>;

    fn load(&self) -> io::Result<Option<HardState>>;

    fn load_snapshot(&self) -> io::Result<Option<Vec<u8>>>;
}

// -- file storage --

/// File-backed storage: `state.json` for the hard state, `snapshot.bin` for
/// the opaque snapshot bytes. Writes go to a temp file which is fsynced and
/// renamed into place.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.bin")
    }

    fn write_atomic(&self, path: PathBuf, bytes: &[u8]) -> io::Result<()> {
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save(&mut self, state: &HardState) -> io::Result<()> {
        let json = serde_json::to_vec(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_atomic(self.state_path(), &json)
    }

    fn save_with_snapshot(&mut self, state: &HardState, snapshot: &[u8]) -> io::Result<()> {
        // Snapshot bytes land first; the state record referencing them is the
        // commit point of the pair.
        self.write_atomic(self.snapshot_path(), snapshot)?;
        self.save(state)
    }

    fn load(&self) -> io::Result<Option<HardState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        let state = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(state))
    }

    fn load_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }
}

// -- in-memory storage --

/// In-memory storage for tests; nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    state: Option<HardState>,
    snapshot: Option<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn save(&mut self, state: &HardState) -> io::Result<()> {
        self.state = Some(state.clone());
        Ok(())
    }

    fn save_with_snapshot(&mut self, state: &HardState, snapshot: &[u8]) -> io::Result<()> {
        self.snapshot = Some(snapshot.to_vec());
        self.save(state)
    }

    fn load(&self) -> io::Result<Option<HardState>> {
        Ok(self.state.clone())
    }

    fn load_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.snapshot.clone())
    }
}

/// A cloneable handle over a [`MemoryStorage`], so a test can crash a node
/// and restart it against the record the old instance wrote.
#[derive(Clone, Default)]
pub struct SharedMemoryStorage {
    inner: Arc<Mutex<MemoryStorage>>,
}

impl SharedMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for SharedMemoryStorage {
    fn save(&mut self, state: &HardState) -> io::Result<()> {
        self.inner.lock().unwrap().save(state)
    }

    fn save_with_snapshot(&mut self, state: &HardState, snapshot: &[u8]) -> io::Result<()> {
        self.inner.lock().unwrap().save_with_snapshot(state, snapshot)
    }

    fn load(&self) -> io::Result<Option<HardState>> {
        self.inner.lock().unwrap().load()
    }

    fn load_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        self.inner.lock().unwrap().load_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> HardState {
        HardState {
            current_term: 5,
            voted_for: Some(2),
            snapshot_index: 0,
            snapshot_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"set x 1".to_vec()),
                LogEntry::new(2, 5, b"set y 2".to_vec()),
            ],
        }
    }

    #[test]
    fn memory_storage_round_trips() {
        let mut storage = MemoryStorage::new();
        storage.save(&sample_state()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample_state()));
    }

    #[test]
    fn memory_storage_starts_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load().unwrap(), None);
        assert_eq!(storage.load_snapshot().unwrap(), None);
    }

    #[test]
    fn shared_storage_survives_handle_drop() {
        let handle = SharedMemoryStorage::new();
        {
            let mut writer = handle.clone();
            writer.save(&sample_state()).unwrap();
        }
        assert_eq!(handle.load().unwrap(), Some(sample_state()));
    }

    #[test]
    fn file_storage_round_trips() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save(&sample_state()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample_state()));
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save_with_snapshot(&sample_state(), b"snapshot bytes")
                .unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load().unwrap(), Some(sample_state()));
        assert_eq!(
            storage.load_snapshot().unwrap(),
            Some(b"snapshot bytes".to_vec())
        );
    }

    #[test]
    fn file_storage_empty_dir_loads_nothing() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load().unwrap(), None);
        assert_eq!(storage.load_snapshot().unwrap(), None);
    }

    #[test]
    fn file_storage_overwrites_previous_record() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save(&sample_state()).unwrap();
        let updated = HardState {
            current_term: 6,
            voted_for: None,
            ..sample_state()
        };
        storage.save(&updated).unwrap();

        assert_eq!(storage.load().unwrap(), Some(updated));
    }
}
