use serde::{Deserialize, Serialize};

use super::configuration::Configuration;

/// Type alias for term numbers
pub type Term = u64;

/// Type alias for log indices
pub type LogIndex = u64;

/// Node identifier
pub type NodeId = String;

/// Opaque application data together with the position range it covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplicationEntry {
    pub lowest_position: u64,
    pub highest_position: u64,
    pub data: Vec<u8>,
}

impl ApplicationEntry {
    pub fn new(lowest_position: u64, highest_position: u64, data: Vec<u8>) -> Self {
        Self {
            lowest_position,
            highest_position,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryPayload {
    /// Written by a new leader as the first entry of its term.
    Initial,
    Application(ApplicationEntry),
    Configuration(Configuration),
}

impl EntryPayload {
    fn digest(&self, crc: u32) -> u32 {
        match self {
            EntryPayload::Initial => crc32c::crc32c_append(crc, &[0]),
            EntryPayload::Application(entry) => {
                let crc = crc32c::crc32c_append(crc, &[1]);
                let crc = crc32c::crc32c_append(crc, &entry.lowest_position.to_le_bytes());
                let crc = crc32c::crc32c_append(crc, &entry.highest_position.to_le_bytes());
                crc32c::crc32c_append(crc, &entry.data)
            }
            EntryPayload::Configuration(configuration) => {
                let crc = crc32c::crc32c_append(crc, &[2]);
                configuration.digest(crc)
            }
        }
    }

    pub fn as_application(&self) -> Option<&ApplicationEntry> {
        match self {
            EntryPayload::Application(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn as_configuration(&self) -> Option<&Configuration> {
        match self {
            EntryPayload::Configuration(configuration) => Some(configuration),
            _ => None,
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log
    pub index: LogIndex,
    pub payload: EntryPayload,
    /// crc32c over index, term and payload
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        let checksum = Self::compute_checksum(term, index, &payload);
        Self {
            term,
            index,
            payload,
            checksum,
        }
    }

    pub fn application(term: Term, index: LogIndex, entry: ApplicationEntry) -> Self {
        Self::new(term, index, EntryPayload::Application(entry))
    }

    fn compute_checksum(term: Term, index: LogIndex, payload: &EntryPayload) -> u32 {
        let crc = crc32c::crc32c(&index.to_le_bytes());
        let crc = crc32c::crc32c_append(crc, &term.to_le_bytes());
        payload.digest(crc)
    }

    /// Returns true if the stored checksum matches the content.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.term, self.index, &self.payload)
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.payload, EntryPayload::Configuration(_))
    }
}
