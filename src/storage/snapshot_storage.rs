use crate::raft::configuration::Configuration;
use crate::raft::types::{LogIndex, Term};
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SnapshotId = String;

/// Describes a snapshot independently of its chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last index captured by the snapshot. 0 means "no snapshot".
    pub index: LogIndex,
    pub term: Term,
    pub chunk_count: u32,
    /// crc32c over all chunks in order
    pub checksum: u32,
    /// Configuration in effect at `index`
    pub configuration: Option<Configuration>,
}

impl SnapshotMeta {
    pub fn id(&self) -> SnapshotId {
        format!("{}-{}-{:08x}", self.index, self.term, self.checksum)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub chunks: Vec<Vec<u8>>,
}

impl Snapshot {
    /// Splits `data` into chunks of at most `chunk_size` bytes.
    pub fn from_data(
        index: LogIndex,
        term: Term,
        configuration: Option<Configuration>,
        data: &[u8],
        chunk_size: usize,
    ) -> Self {
        let mut chunks: Vec<Vec<u8>> = data
            .chunks(chunk_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        Self::from_chunks(index, term, configuration, chunks)
    }

    pub fn from_chunks(
        index: LogIndex,
        term: Term,
        configuration: Option<Configuration>,
        chunks: Vec<Vec<u8>>,
    ) -> Self {
        let meta = SnapshotMeta {
            index,
            term,
            chunk_count: chunks.len() as u32,
            checksum: Self::checksum_of(&chunks),
            configuration,
        };
        Self { meta, chunks }
    }

    pub fn checksum_of(chunks: &[Vec<u8>]) -> u32 {
        chunks
            .iter()
            .fold(0, |crc, chunk| crc32c::crc32c_append(crc, chunk))
    }

    pub fn verify(&self) -> bool {
        self.meta.chunk_count as usize == self.chunks.len()
            && self.meta.checksum == Self::checksum_of(&self.chunks)
    }

    pub fn data(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Notified after a new snapshot has been persisted.
pub trait SnapshotListener: Send {
    fn on_new_snapshot(&mut self, meta: &SnapshotMeta);
}

/// Runs before a snapshot is written; a failure aborts the persist.
pub trait PersistHook: Send {
    fn before_persist(&mut self, meta: &SnapshotMeta) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistHook;

impl PersistHook for NoopPersistHook {
    fn before_persist(&mut self, _meta: &SnapshotMeta) -> io::Result<()> {
        Ok(())
    }
}

/// Counts persists and fails a configurable number of them.
#[derive(Debug, Default, Clone)]
pub struct FaultyPersistHook {
    remaining_failures: Arc<AtomicU32>,
    persists: Arc<AtomicU32>,
}

impl FaultyPersistHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Number of persist attempts that went through.
    pub fn persists(&self) -> u32 {
        self.persists.load(Ordering::SeqCst)
    }
}

impl PersistHook for FaultyPersistHook {
    fn before_persist(&mut self, meta: &SnapshotMeta) -> io::Result<()> {
        let fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected persist failure for snapshot {}", meta.id()),
            ));
        }
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for snapshot storage
pub trait SnapshotStore: Send {
    fn latest(&self) -> Option<Snapshot>;
    fn latest_meta(&self) -> Option<SnapshotMeta>;
    /// Chunk `chunk_index` of the latest snapshot.
    fn read_chunk(&self, chunk_index: u32) -> Option<Vec<u8>>;
    /// Persists `snapshot` if it is newer than the latest one.
    fn persist(&mut self, snapshot: Snapshot) -> Result<()>;
    fn add_listener(&mut self, listener: Box<dyn SnapshotListener>);

    fn snapshot_index(&self) -> LogIndex {
        self.latest_meta().map(|m| m.index).unwrap_or(0)
    }
}

struct StoreState {
    latest: Option<Snapshot>,
    listeners: Vec<Box<dyn SnapshotListener>>,
    hook: Box<dyn PersistHook>,
}

impl StoreState {
    fn new(hook: Box<dyn PersistHook>) -> Self {
        Self {
            latest: None,
            listeners: Vec::new(),
            hook,
        }
    }

    /// Returns false when the snapshot is not newer than the latest one.
    fn prepare(&mut self, snapshot: &Snapshot) -> Result<bool> {
        if snapshot.meta.index == 0 {
            return Err(RaftError::InvalidState(
                "snapshot index 0 is reserved".to_string(),
            ));
        }
        if !snapshot.verify() {
            return Err(RaftError::InvalidState(format!(
                "snapshot {} does not match its checksum",
                snapshot.meta.id()
            )));
        }
        let latest_index = self.latest.as_ref().map(|s| s.meta.index).unwrap_or(0);
        if snapshot.meta.index <= latest_index {
            return Ok(false);
        }
        self.hook
            .before_persist(&snapshot.meta)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        Ok(true)
    }

    fn chunk(&self, chunk_index: u32) -> Option<Vec<u8>> {
        self.latest
            .as_ref()
            .and_then(|s| s.chunks.get(chunk_index as usize).cloned())
    }

    fn publish(&mut self, snapshot: Snapshot) {
        for listener in self.listeners.iter_mut() {
            listener.on_new_snapshot(&snapshot.meta);
        }
        self.latest = Some(snapshot);
    }
}

/// Keeps each snapshot in `snapshots/<id>/` as a JSON descriptor plus one file per chunk.
pub struct FileSnapshotStore {
    data_dir: PathBuf,
    state: StoreState,
}

impl FileSnapshotStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        Self::with_hook(data_dir, Box::new(NoopPersistHook))
    }

    pub fn with_hook(data_dir: PathBuf, hook: Box<dyn PersistHook>) -> Result<Self> {
        let mut store = Self {
            data_dir,
            state: StoreState::new(hook),
        };
        fs::create_dir_all(store.snapshots_dir())?;
        store.state.latest = store.load_latest()?;
        Ok(store)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    fn load_latest(&self) -> Result<Option<Snapshot>> {
        let mut newest: Option<(LogIndex, PathBuf)> = None;
        for dir_entry in fs::read_dir(self.snapshots_dir())? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                // Leftover of an interrupted persist
                fs::remove_dir_all(&path)?;
                continue;
            }
            let descriptor = path.join("descriptor.json");
            if !descriptor.exists() {
                continue;
            }
            let meta = Self::read_meta(&descriptor)?;
            if newest.as_ref().map(|(i, _)| meta.index > *i).unwrap_or(true) {
                newest = Some((meta.index, path));
            }
        }

        let Some((_, path)) = newest else {
            return Ok(None);
        };
        let meta = Self::read_meta(&path.join("descriptor.json"))?;
        let mut chunks = Vec::with_capacity(meta.chunk_count as usize);
        for n in 0..meta.chunk_count {
            let bytes = fs::read(path.join(format!("chunk-{}.bin", n))).map_err(|e| {
                RaftError::Corruption(format!("snapshot {} misses chunk {}: {}", meta.id(), n, e))
            })?;
            let chunk: Vec<u8> = bincode::deserialize(&bytes).map_err(|e| {
                RaftError::Corruption(format!("snapshot {} chunk {}: {}", meta.id(), n, e))
            })?;
            chunks.push(chunk);
        }

        let snapshot = Snapshot { meta, chunks };
        if !snapshot.verify() {
            return Err(RaftError::Corruption(format!(
                "snapshot {} failed checksum verification",
                snapshot.meta.id()
            )));
        }
        tracing::info!(
            "Loaded snapshot {} (index {}, term {})",
            snapshot.meta.id(),
            snapshot.meta.index,
            snapshot.meta.term
        );
        Ok(Some(snapshot))
    }

    fn read_meta(path: &PathBuf) -> Result<SnapshotMeta> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RaftError::Corruption(format!("unreadable snapshot descriptor {:?}: {}", path, e))
        })
    }

    fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let id = snapshot.meta.id();
        let target = self.snapshots_dir().join(&id);
        let tmp = self.snapshots_dir().join(format!("{}.tmp", id));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;
        for (n, chunk) in snapshot.chunks.iter().enumerate() {
            fs::write(tmp.join(format!("chunk-{}.bin", n)), bincode::serialize(chunk)?)?;
        }
        fs::write(
            tmp.join("descriptor.json"),
            serde_json::to_vec_pretty(&snapshot.meta)?,
        )?;
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn purge_older_than(&self, index: LogIndex) -> Result<()> {
        for dir_entry in fs::read_dir(self.snapshots_dir())? {
            let path = dir_entry?.path();
            let descriptor = path.join("descriptor.json");
            if !descriptor.exists() {
                continue;
            }
            if Self::read_meta(&descriptor)?.index < index {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn latest(&self) -> Option<Snapshot> {
        self.state.latest.clone()
    }

    fn latest_meta(&self) -> Option<SnapshotMeta> {
        self.state.latest.as_ref().map(|s| s.meta.clone())
    }

    fn read_chunk(&self, chunk_index: u32) -> Option<Vec<u8>> {
        self.state.chunk(chunk_index)
    }

    fn persist(&mut self, snapshot: Snapshot) -> Result<()> {
        if !self.state.prepare(&snapshot)? {
            return Ok(());
        }
        self.write(&snapshot)?;
        self.purge_older_than(snapshot.meta.index)?;
        tracing::info!(
            "Persisted snapshot {} at index {}",
            snapshot.meta.id(),
            snapshot.meta.index
        );
        self.state.publish(snapshot);
        Ok(())
    }

    fn add_listener(&mut self, listener: Box<dyn SnapshotListener>) {
        self.state.listeners.push(listener);
    }
}

/// In-memory snapshot store; clones share the stored snapshot.
#[derive(Clone)]
pub struct MemorySnapshotStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::with_hook(Box::new(NoopPersistHook))
    }

    pub fn with_hook(hook: Box<dyn PersistHook>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::new(hook))),
        }
    }

    fn inner(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn latest(&self) -> Option<Snapshot> {
        self.inner().latest.clone()
    }

    fn latest_meta(&self) -> Option<SnapshotMeta> {
        self.inner().latest.as_ref().map(|s| s.meta.clone())
    }

    fn read_chunk(&self, chunk_index: u32) -> Option<Vec<u8>> {
        self.inner().chunk(chunk_index)
    }

    fn persist(&mut self, snapshot: Snapshot) -> Result<()> {
        let mut state = self.inner();
        if state.prepare(&snapshot)? {
            state.publish(snapshot);
        }
        Ok(())
    }

    fn add_listener(&mut self, listener: Box<dyn SnapshotListener>) {
        self.inner().listeners.push(listener);
    }
}
