use serde::{Deserialize, Serialize};

use super::configuration::{Configuration, Member};
use super::types::{LogEntry, LogIndex, NodeId, Term};
use crate::storage::snapshot_storage::{SnapshotId, SnapshotMeta};

/// RequestVote RPC - Invoked by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - Invoked by leader to replicate log entries and as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,
    /// So follower can redirect clients
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub leader_commit: LogIndex,
    /// Echoed in the response
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// On success the last durably appended index, on failure the index to resume after
    pub last_log_index: LogIndex,
    pub last_snapshot_index: LogIndex,
    pub configuration_index: LogIndex,
    pub request_id: u64,
}

/// One chunk of a snapshot pushed by the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub chunk_index: u32,
    pub data: Vec<u8>,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    Ack,
    Reject(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub snapshot_id: SnapshotId,
    pub chunk_index: u32,
    pub status: InstallStatus,
    /// The member already holds this snapshot or everything it covers
    pub complete: bool,
}

/// Pushes the leader's configuration to a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub configuration: Configuration,
    pub joint: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureResponse {
    pub term: Term,
    pub accepted: bool,
    pub configuration_index: LogIndex,
}

/// Installs `members` without quorum agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceConfigureRequest {
    pub term: Term,
    pub index: LogIndex,
    pub members: Vec<Member>,
    pub request_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceConfigureResponse {
    pub term: Term,
    pub accepted: bool,
    pub request_id: u64,
    pub reason: Option<String>,
}

/// Asks the leader to add `member`; answered to `origin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub origin: NodeId,
    pub request_id: u64,
    pub member: Member,
}

/// Asks the leader to remove `member_id`; answered to `origin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub origin: NodeId,
    pub request_id: u64,
    pub member_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    pub request_id: u64,
    pub result: std::result::Result<Configuration, String>,
}

/// Wrapper for all RPC messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    Configure(ConfigureRequest),
    ConfigureResponse(ConfigureResponse),
    ForceConfigure(ForceConfigureRequest),
    ForceConfigureResponse(ForceConfigureResponse),
    Join(JoinRequest),
    Leave(LeaveRequest),
    ReconfigureResponse(ReconfigureResponse),
}

impl RaftMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "RequestVote",
            RaftMessage::RequestVoteResponse(_) => "RequestVoteResponse",
            RaftMessage::AppendEntries(_) => "AppendEntries",
            RaftMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
            RaftMessage::InstallSnapshot(_) => "InstallSnapshot",
            RaftMessage::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
            RaftMessage::Configure(_) => "Configure",
            RaftMessage::ConfigureResponse(_) => "ConfigureResponse",
            RaftMessage::ForceConfigure(_) => "ForceConfigure",
            RaftMessage::ForceConfigureResponse(_) => "ForceConfigureResponse",
            RaftMessage::Join(_) => "Join",
            RaftMessage::Leave(_) => "Leave",
            RaftMessage::ReconfigureResponse(_) => "ReconfigureResponse",
        }
    }
}

/// An outbound message produced by a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}
