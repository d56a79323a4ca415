pub mod actor;
pub mod configuration;
pub mod election;
pub mod log;
pub mod reconfigure;
pub mod rpc;
pub mod server;
mod snapshot;
pub mod state;
pub mod types;

pub use configuration::{Configuration, Member, MemberType};
pub use log::{AppendHandle, AppendOutcome, EntryValidator, NoopEntryValidator, PositionValidator};
pub use reconfigure::{ReconfigureHandle, ReconfigureResult};
pub use rpc::{Envelope, RaftMessage};
pub use server::{RaftServer, RaftStateInfo, StartMode};
pub use state::NodeState;
pub use types::{ApplicationEntry, EntryPayload, LogEntry, LogIndex, NodeId, Term};
