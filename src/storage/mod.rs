pub mod flush;
pub mod log_storage;
pub mod snapshot_storage;
pub mod state_storage;

pub use flush::{FaultyFlush, FlushStrategy, FlushTarget, NoopFlush, SyncFlush};
pub use log_storage::{FileLogStorage, LogStorage, MemoryLogStorage};
pub use snapshot_storage::{
    FaultyPersistHook, FileSnapshotStore, MemorySnapshotStore, NoopPersistHook, PersistHook,
    Snapshot, SnapshotId, SnapshotListener, SnapshotMeta, SnapshotStore,
};
pub use state_storage::{FileStateStorage, MemoryStateStorage, PersistentState, StateStorage};

use crate::util::errors::Result;
use std::path::PathBuf;

/// Everything a member persists: journal, metadata and snapshots.
pub struct RaftStorage {
    pub log: Box<dyn LogStorage>,
    pub state: Box<dyn StateStorage>,
    pub snapshots: Box<dyn SnapshotStore>,
}

impl RaftStorage {
    /// Opens (or creates) the file-backed stores under `data_dir`.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        Self::open_with(data_dir, Box::new(SyncFlush), Box::new(NoopPersistHook))
    }

    pub fn open_with(
        data_dir: PathBuf,
        flusher: Box<dyn FlushStrategy>,
        hook: Box<dyn PersistHook>,
    ) -> Result<Self> {
        Ok(Self {
            log: Box::new(FileLogStorage::with_flusher(data_dir.clone(), flusher)?),
            state: Box::new(FileStateStorage::new(data_dir.clone())?),
            snapshots: Box::new(FileSnapshotStore::with_hook(data_dir, hook)?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            log: Box::new(MemoryLogStorage::new()),
            state: Box::new(MemoryStateStorage::new()),
            snapshots: Box::new(MemorySnapshotStore::new()),
        }
    }
}
