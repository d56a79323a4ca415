use crate::raft::configuration::Configuration;
use crate::raft::types::{LogIndex, NodeId, Term};
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Persistent state that must survive crashes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
    /// Highest commit index this member has learned
    pub commit_index: LogIndex,
    /// Latest configuration, including forced ones that never hit the journal
    pub configuration: Option<Configuration>,
}

/// Trait for persistent state storage
pub trait StateStorage: Send {
    fn save_term(&mut self, term: Term) -> Result<()>;
    fn load_term(&self) -> Result<Term>;
    fn save_voted_for(&mut self, peer_id: Option<NodeId>) -> Result<()>;
    fn load_voted_for(&self) -> Result<Option<NodeId>>;
    fn save_commit_index(&mut self, index: LogIndex) -> Result<()>;
    fn load_commit_index(&self) -> Result<LogIndex>;
    fn save_configuration(&mut self, configuration: &Configuration) -> Result<()>;
    fn load_configuration(&self) -> Result<Option<Configuration>>;
    fn save_state(&mut self, state: &PersistentState) -> Result<()>;
    fn load_state(&self) -> Result<PersistentState>;
}

/// File-based state storage implementation
pub struct FileStateStorage {
    data_dir: PathBuf,
    state: PersistentState,
}

impl FileStateStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        fs::create_dir_all(&data_dir)?;

        let mut storage = Self {
            data_dir,
            state: PersistentState::default(),
        };

        // Load existing state from disk
        storage.state = storage.load_from_disk()?;

        Ok(storage)
    }

    fn state_file_path(&self) -> PathBuf {
        self.data_dir.join("raft_state.bin")
    }

    fn load_from_disk(&self) -> Result<PersistentState> {
        let state_path = self.state_file_path();

        if !state_path.exists() {
            return Ok(PersistentState::default());
        }

        let mut file = File::open(&state_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.is_empty() {
            return Ok(PersistentState::default());
        }

        let state: PersistentState = bincode::deserialize(&buffer)
            .map_err(|e| RaftError::Corruption(format!("unreadable metadata: {}", e)))?;

        tracing::info!(
            "Loaded persistent state: term={}, voted_for={:?}, commit_index={}",
            state.current_term,
            state.voted_for,
            state.commit_index
        );

        Ok(state)
    }

    fn save_to_disk(&self) -> Result<()> {
        let state_path = self.state_file_path();
        let tmp_path = state_path.with_extension("tmp");
        let encoded = bincode::serialize(&self.state)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &state_path)?;

        Ok(())
    }
}

impl StateStorage for FileStateStorage {
    fn save_term(&mut self, term: Term) -> Result<()> {
        self.state.current_term = term;
        self.save_to_disk()
    }

    fn load_term(&self) -> Result<Term> {
        Ok(self.state.current_term)
    }

    fn save_voted_for(&mut self, peer_id: Option<NodeId>) -> Result<()> {
        self.state.voted_for = peer_id;
        self.save_to_disk()
    }

    fn load_voted_for(&self) -> Result<Option<NodeId>> {
        Ok(self.state.voted_for.clone())
    }

    fn save_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.state.commit_index = index;
        self.save_to_disk()
    }

    fn load_commit_index(&self) -> Result<LogIndex> {
        Ok(self.state.commit_index)
    }

    fn save_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.state.configuration = Some(configuration.clone());
        self.save_to_disk()
    }

    fn load_configuration(&self) -> Result<Option<Configuration>> {
        Ok(self.state.configuration.clone())
    }

    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        self.state = state.clone();
        self.save_to_disk()
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.clone())
    }
}

/// In-memory metadata. Clones share state so it outlives a member restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStorage {
    state: Arc<Mutex<PersistentState>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, PersistentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStorage for MemoryStateStorage {
    fn save_term(&mut self, term: Term) -> Result<()> {
        self.inner().current_term = term;
        Ok(())
    }

    fn load_term(&self) -> Result<Term> {
        Ok(self.inner().current_term)
    }

    fn save_voted_for(&mut self, peer_id: Option<NodeId>) -> Result<()> {
        self.inner().voted_for = peer_id;
        Ok(())
    }

    fn load_voted_for(&self) -> Result<Option<NodeId>> {
        Ok(self.inner().voted_for.clone())
    }

    fn save_commit_index(&mut self, index: LogIndex) -> Result<()> {
        self.inner().commit_index = index;
        Ok(())
    }

    fn load_commit_index(&self) -> Result<LogIndex> {
        Ok(self.inner().commit_index)
    }

    fn save_configuration(&mut self, configuration: &Configuration) -> Result<()> {
        self.inner().configuration = Some(configuration.clone());
        Ok(())
    }

    fn load_configuration(&self) -> Result<Option<Configuration>> {
        Ok(self.inner().configuration.clone())
    }

    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        *self.inner() = state.clone();
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.inner().clone())
    }
}
