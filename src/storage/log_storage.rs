use crate::raft::types::{LogEntry, LogIndex, Term};
use crate::storage::flush::{FlushStrategy, FlushTarget, SyncFlush};
use crate::util::errors::{RaftError, Result};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Trait for persistent log storage
///
/// Indices are 1-based. An empty journal reports `last_index() == first_index() - 1`.
pub trait LogStorage: Send {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()>;
    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>>;
    /// Entries in `start..=end` that are present.
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>>;
    fn first_index(&self) -> LogIndex;
    fn last_index(&self) -> LogIndex;
    fn last_term(&self) -> Term;
    /// Deletes every entry at or after `from_index`.
    fn truncate(&mut self, from_index: LogIndex) -> Result<()>;
    /// Deletes every entry at or below `until_index`.
    fn compact(&mut self, until_index: LogIndex) -> Result<()>;
    /// Drops all entries; the next append must carry `next_index`.
    fn reset(&mut self, next_index: LogIndex) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn last_flushed_index(&self) -> LogIndex;

    fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    /// Checks that stored entries are contiguous, intact and never go back in term.
    fn verify_integrity(&self) -> Result<()> {
        let entries = self.get_range(self.first_index(), self.last_index())?;
        let log = EntryLog {
            first_index: self.first_index(),
            entries: entries.into(),
            flushed: self.last_flushed_index(),
        };
        log.validate()
    }
}

/// In-memory view of the journal shared by the file and memory backends.
#[derive(Debug, Clone)]
struct EntryLog {
    first_index: LogIndex,
    entries: VecDeque<LogEntry>,
    flushed: LogIndex,
}

impl EntryLog {
    fn new(first_index: LogIndex) -> Self {
        Self {
            first_index,
            entries: VecDeque::new(),
            flushed: first_index.saturating_sub(1),
        }
    }

    fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.first_index - 1)
    }

    fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(0)
    }

    fn check_append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::InvalidState(format!(
                    "append expected index {} but got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<LogEntry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize).cloned()
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        let start = start.max(self.first_index);
        let end = end.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        let from = (start - self.first_index) as usize;
        let to = (end - self.first_index) as usize;
        self.entries.range(from..=to).cloned().collect()
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<bool> {
        if from_index < self.first_index {
            return Err(RaftError::InvalidState(format!(
                "cannot truncate at {} below first index {}",
                from_index, self.first_index
            )));
        }
        if from_index > self.last_index() {
            return Ok(false);
        }
        self.entries.truncate((from_index - self.first_index) as usize);
        self.flushed = self.flushed.min(self.last_index());
        Ok(true)
    }

    fn compact(&mut self, until_index: LogIndex) -> bool {
        if until_index < self.first_index {
            return false;
        }
        if until_index >= self.last_index() {
            self.entries.clear();
        } else {
            self.entries.drain(..(until_index + 1 - self.first_index) as usize);
        }
        self.first_index = until_index + 1;
        self.flushed = self.flushed.max(until_index);
        true
    }

    fn reset(&mut self, next_index: LogIndex) {
        *self = Self::new(next_index.max(1));
    }

    fn validate(&self) -> Result<()> {
        let mut expected = self.first_index;
        let mut last_term = 0;
        for entry in &self.entries {
            if entry.index != expected {
                return Err(RaftError::Corruption(format!(
                    "journal gap: expected index {} but found {}",
                    expected, entry.index
                )));
            }
            if !entry.verify() {
                return Err(RaftError::Corruption(format!(
                    "checksum mismatch at index {}",
                    entry.index
                )));
            }
            if entry.term < last_term {
                return Err(RaftError::Corruption(format!(
                    "term regressed from {} to {} at index {}",
                    last_term, entry.term, entry.index
                )));
            }
            last_term = entry.term;
            expected += 1;
        }
        Ok(())
    }
}

impl FlushTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

struct NoTarget;

impl FlushTarget for NoTarget {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File-based log storage implementation using bincode
///
/// The journal file starts with the first index as a header record, followed by
/// length-prefixed entry records. Appends go to the end of the file and become
/// durable only after `flush`. Structural changes rewrite the file atomically.
pub struct FileLogStorage {
    data_dir: PathBuf,
    log: EntryLog,
    file: File,
    flusher: Box<dyn FlushStrategy>,
}

impl FileLogStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        Self::with_flusher(data_dir, Box::new(SyncFlush))
    }

    pub fn with_flusher(data_dir: PathBuf, flusher: Box<dyn FlushStrategy>) -> Result<Self> {
        // Create data directory if it doesn't exist
        fs::create_dir_all(&data_dir)?;

        let log = Self::load_from_disk(&Self::log_file_path_in(&data_dir))?;
        let path = Self::log_file_path_in(&data_dir);
        if !path.exists() {
            Self::write_file(&path, &log)?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            data_dir,
            log,
            file,
            flusher,
        })
    }

    fn log_file_path_in(data_dir: &PathBuf) -> PathBuf {
        data_dir.join("journal.bin")
    }

    fn log_file_path(&self) -> PathBuf {
        Self::log_file_path_in(&self.data_dir)
    }

    fn load_from_disk(path: &PathBuf) -> Result<EntryLog> {
        if !path.exists() {
            return Ok(EntryLog::new(1));
        }

        let mut buffer = Vec::new();
        File::open(path)?.read_to_end(&mut buffer)?;

        let mut records = RecordReader::new(&buffer);
        let first_index: LogIndex = match records.next_record()? {
            Some(bytes) => bincode::deserialize(bytes)
                .map_err(|e| RaftError::Corruption(format!("unreadable journal header: {}", e)))?,
            None => return Ok(EntryLog::new(1)),
        };

        let mut log = EntryLog::new(first_index.max(1));
        while let Some(bytes) = records.next_record()? {
            let entry: LogEntry = bincode::deserialize(bytes).map_err(|e| {
                RaftError::Corruption(format!(
                    "unreadable journal record after index {}: {}",
                    log.last_index(),
                    e
                ))
            })?;
            log.entries.push_back(entry);
        }
        log.validate()?;
        log.flushed = log.last_index();

        tracing::info!(
            "Loaded {} journal entries from disk (first index {})",
            log.entries.len(),
            log.first_index
        );
        Ok(log)
    }

    fn encode_record(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    fn write_file(path: &PathBuf, log: &EntryLog) -> Result<()> {
        let mut buffer = Vec::new();
        Self::encode_record(&mut buffer, &bincode::serialize(&log.first_index)?);
        for entry in &log.entries {
            Self::encode_record(&mut buffer, &bincode::serialize(entry)?);
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn rewrite(&mut self) -> Result<()> {
        let path = self.log_file_path();
        Self::write_file(&path, &self.log)?;
        self.file = OpenOptions::new().append(true).open(&path)?;
        Ok(())
    }
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.log.check_append(&entries)?;

        let mut buffer = Vec::new();
        for entry in &entries {
            Self::encode_record(&mut buffer, &bincode::serialize(entry)?);
        }
        self.file.write_all(&buffer)?;
        self.log.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.log.get(index))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.log.get_range(start, end))
    }

    fn first_index(&self) -> LogIndex {
        self.log.first_index
    }

    fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }

    fn last_term(&self) -> Term {
        self.log.last_term()
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if self.log.truncate(from_index)? {
            self.rewrite()?;
            tracing::info!("Truncated journal from index {}", from_index);
        }
        Ok(())
    }

    fn compact(&mut self, until_index: LogIndex) -> Result<()> {
        if self.log.compact(until_index) {
            self.rewrite()?;
            tracing::debug!("Compacted journal up to index {}", until_index);
        }
        Ok(())
    }

    fn reset(&mut self, next_index: LogIndex) -> Result<()> {
        self.log.reset(next_index);
        self.rewrite()?;
        tracing::info!("Reset journal, next index {}", next_index);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flusher
            .flush(&mut self.file)
            .map_err(|e| RaftError::FlushFailed(e.to_string()))?;
        self.log.flushed = self.log.last_index();
        Ok(())
    }

    fn last_flushed_index(&self) -> LogIndex {
        self.log.flushed
    }
}

/// Splits a byte buffer into length-prefixed records.
struct RecordReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    fn next_record(&mut self) -> Result<Option<&'a [u8]>> {
        if self.offset == self.buffer.len() {
            return Ok(None);
        }
        let header_end = self.offset + 4;
        if header_end > self.buffer.len() {
            return Err(RaftError::Corruption(format!(
                "truncated record header at byte {}",
                self.offset
            )));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.buffer[self.offset..header_end]);
        let end = header_end + u32::from_le_bytes(len) as usize;
        if end > self.buffer.len() {
            return Err(RaftError::Corruption(format!(
                "truncated record at byte {}",
                self.offset
            )));
        }
        self.offset = end;
        Ok(Some(&self.buffer[header_end..end]))
    }
}

/// In-memory journal. Clones share the same entries, so a handle kept outside
/// a member survives that member's restart the way a disk would.
#[derive(Clone)]
pub struct MemoryLogStorage {
    log: Arc<Mutex<EntryLog>>,
    flusher: Arc<Mutex<Box<dyn FlushStrategy>>>,
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::with_flusher(Box::new(super::flush::NoopFlush))
    }

    pub fn with_flusher(flusher: Box<dyn FlushStrategy>) -> Self {
        Self {
            log: Arc::new(Mutex::new(EntryLog::new(1))),
            flusher: Arc::new(Mutex::new(flusher)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, EntryLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates a crash: everything appended after the last flush is gone.
    pub fn crash(&self) {
        let mut log = self.inner();
        let flushed = log.flushed;
        if flushed < log.last_index() && flushed + 1 >= log.first_index {
            let keep = (flushed + 1 - log.first_index) as usize;
            log.entries.truncate(keep);
        }
    }

    /// Replaces the entry at `index` without fixing its checksum.
    pub fn corrupt(&self, index: LogIndex, payload: crate::raft::types::EntryPayload) -> bool {
        let mut log = self.inner();
        if index < log.first_index {
            return false;
        }
        let offset = (index - log.first_index) as usize;
        match log.entries.get_mut(offset) {
            Some(entry) => {
                entry.payload = payload;
                true
            }
            None => false,
        }
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut log = self.inner();
        log.check_append(&entries)?;
        log.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.inner().get(index))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.inner().get_range(start, end))
    }

    fn first_index(&self) -> LogIndex {
        self.inner().first_index
    }

    fn last_index(&self) -> LogIndex {
        self.inner().last_index()
    }

    fn last_term(&self) -> Term {
        self.inner().last_term()
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        self.inner().truncate(from_index).map(|_| ())
    }

    fn compact(&mut self, until_index: LogIndex) -> Result<()> {
        self.inner().compact(until_index);
        Ok(())
    }

    fn reset(&mut self, next_index: LogIndex) -> Result<()> {
        self.inner().reset(next_index);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        flusher
            .flush(&mut NoTarget)
            .map_err(|e| RaftError::FlushFailed(e.to_string()))?;
        let mut log = self.inner();
        log.flushed = log.last_index();
        Ok(())
    }

    fn last_flushed_index(&self) -> LogIndex {
        self.inner().flushed
    }
}
