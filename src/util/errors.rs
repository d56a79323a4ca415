use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unreadable or inconsistent persisted state. Never repaired in place.
    #[error("Corrupted state: {0}")]
    Corruption(String),

    /// An invariant of the replication protocol was broken.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Committed data was lost: {0}")]
    DataLoss(String),

    #[error("Not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl RaftError {
    /// Fatal errors stop the member; everything else is retried or reported.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Corruption(_) | RaftError::ProtocolViolation(_) | RaftError::DataLoss(_)
        )
    }
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
