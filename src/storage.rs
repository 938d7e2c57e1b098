use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;

/// The durable portion of a node's state.
///
/// Written as one unit: a crash during `save` must leave either the previous
/// triple or the new one, never a mix. The snapshot anchor rides along so a
/// compacted log can be reloaded with its `(index, term)` base intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
}

/// Durable storage for Raft state.
///
/// The consensus core calls `save` on every mutation of the persistent
/// fields, before the mutation becomes visible to any peer. `load` returns
/// `None` on first boot.
pub trait Storage: Send + Sync {
    fn save(&self, state: &PersistedState) -> io::Result<()>;
    fn load(&self) -> io::Result<Option<PersistedState>>;
}

/// File-backed storage, one JSON document per node.
///
/// Writes go to a temp file which is fsynced and renamed over the previous
/// state, so a crash mid-write leaves the old document readable.
pub struct FileStorage {
    dir: PathBuf,
    // save/load may be called from concurrent RPC handlers of one node
    lock: Mutex<()>,
}

impl FileStorage {
    /// Create a new FileStorage rooted at the given directory, creating it
    /// if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.json")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("raft-state.tmp")
    }
}

impl Storage for FileStorage {
    fn save(&self, state: &PersistedState) -> io::Result<()> {
        let _guard = self.lock.lock().expect("storage lock poisoned");

        let json = serde_json::to_string(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedState>> {
        let _guard = self.lock.lock().expect("storage lock poisoned");

        let path = self.state_path();
        if !path.exists() {
            return Ok(None); // first boot
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let state: PersistedState = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(state))
    }
}

/// In-memory storage.
///
/// Keeps the triple across `RaftNode` restarts that share the same instance,
/// which is what the cluster tests use to simulate crash/recover without
/// touching the filesystem.
#[derive(Default)]
pub struct MemStorage {
    state: Mutex<Option<PersistedState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save(&self, state: &PersistedState) -> io::Result<()> {
        *self.state.lock().expect("storage lock poisoned") = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedState>> {
        Ok(self.state.lock().expect("storage lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        PersistedState {
            current_term: 5,
            voted_for: Some(2),
            log: vec![
                LogEntry {
                    term: 1,
                    index: 1,
                    command: b"x=1".to_vec(),
                },
                LogEntry {
                    term: 5,
                    index: 2,
                    command: b"x=2".to_vec(),
                },
            ],
            snapshot_index: 0,
            snapshot_term: 0,
        }
    }

    #[test]
    fn mem_storage_round_trip() {
        let storage = MemStorage::new();
        assert!(storage.load().unwrap().is_none());

        let state = sample_state();
        storage.save(&state).unwrap();

        assert_eq!(storage.load().unwrap(), Some(state));
    }

    #[test]
    fn file_storage_first_boot_is_empty() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn file_storage_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let state = sample_state();
        storage.save(&state).unwrap();

        assert_eq!(storage.load().unwrap(), Some(state));
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.save(&sample_state()).unwrap();
        }

        // "restart" - new storage instance over the same directory
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let loaded = storage.load().unwrap().expect("state should survive");
            assert_eq!(loaded.current_term, 5);
            assert_eq!(loaded.voted_for, Some(2));
            assert_eq!(loaded.log.len(), 2);
        }
    }

    #[test]
    fn file_storage_overwrites_whole_triple() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.save(&sample_state()).unwrap();

        let newer = PersistedState {
            current_term: 9,
            voted_for: None,
            log: Vec::new(),
            snapshot_index: 2,
            snapshot_term: 5,
        };
        storage.save(&newer).unwrap();

        assert_eq!(storage.load().unwrap(), Some(newer));
    }

    #[test]
    fn file_storage_keeps_snapshot_anchor() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let mut state = sample_state();
        state.snapshot_index = 7;
        state.snapshot_term = 3;
        storage.save(&state).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.snapshot_index, 7);
        assert_eq!(loaded.snapshot_term, 3);
    }
}
