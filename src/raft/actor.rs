use actix::prelude::*;
use std::time::Duration;

use super::configuration::Member;
use super::log::AppendHandle;
use super::reconfigure::ReconfigureHandle;
use super::rpc::RaftMessage;
use super::server::{RaftServer, RaftStateInfo, StartMode};
use super::types::{ApplicationEntry, LogEntry, LogIndex, NodeId};
use crate::config::RaftConfig;
use crate::storage::{RaftStorage, SnapshotMeta};
use crate::util::errors::Result;

/// Messages that the Raft actor can handle

/// Handle incoming Raft RPC message
#[derive(Message)]
#[rtype(result = "()")]
pub struct HandleRaftMessage {
    pub from: NodeId,
    pub message: RaftMessage,
}

/// Submit an entry to be replicated (only the leader accepts it)
#[derive(Message)]
#[rtype(result = "AppendHandle")]
pub struct SubmitEntry {
    pub entry: ApplicationEntry,
}

#[derive(Message)]
#[rtype(result = "ReconfigureHandle")]
pub struct Join {
    pub member: Member,
}

#[derive(Message)]
#[rtype(result = "ReconfigureHandle")]
pub struct Leave {
    pub member_id: NodeId,
}

#[derive(Message)]
#[rtype(result = "ReconfigureHandle")]
pub struct ForceConfigure {
    pub members: Vec<Member>,
}

/// Persist application state covering the journal up to `index`
#[derive(Message)]
#[rtype(result = "Result<SnapshotMeta>")]
pub struct TakeSnapshot {
    pub index: LogIndex,
    pub data: Vec<u8>,
}

/// Get current Raft state (for debugging/monitoring)
#[derive(Message)]
#[rtype(result = "RaftStateInfo")]
pub struct GetState;

/// Stop the member; pending requests fail
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

// Implement MessageResponse for RaftStateInfo
impl<A, M> actix::dev::MessageResponse<A, M> for RaftStateInfo
where
    A: Actor,
    M: Message<Result = RaftStateInfo>,
{
    fn handle(self, _ctx: &mut A::Context, tx: Option<actix::dev::OneshotSender<M::Result>>) {
        if let Some(tx) = tx {
            let _ = tx.send(self);
        }
    }
}

/// Message to send Raft RPC to network layer
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct SendRaftMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

/// Entries committed since the last notification, in commit order
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct CommittedEntries {
    pub member: NodeId,
    pub entries: Vec<LogEntry>,
}

/// Set network address for sending messages
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetNetworkAddress {
    pub addr: Recipient<SendRaftMessage>,
}

/// Set the recipient of committed entries
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetCommitListener {
    pub addr: Recipient<CommittedEntries>,
}

/// Drives one `RaftServer`: feeds it ticks and messages and ships what it
/// produces.
pub struct RaftActor {
    server: RaftServer,
    tick_interval: Duration,
    tick_handle: Option<SpawnHandle>,
    // Address to send outgoing RPC messages (set by the network layer)
    network_addr: Option<Recipient<SendRaftMessage>>,
    commit_listener: Option<Recipient<CommittedEntries>>,
}

impl Actor for RaftActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("Raft actor for node {} started", self.server.id());
        self.server.start();
        let handle = ctx.run_interval(self.tick_interval, |act, _ctx| {
            act.server.tick();
            act.dispatch();
        });
        self.tick_handle = Some(handle);
        self.dispatch();
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.server.shutdown();
        tracing::info!("Raft actor for node {} stopped", self.server.id());
    }
}

impl RaftActor {
    pub fn new(server: RaftServer, tick_interval: Duration) -> Self {
        Self {
            server,
            tick_interval,
            tick_handle: None,
            network_addr: None,
            commit_listener: None,
        }
    }

    /// Opens the member's file storage under `data_dir/<node_id>`.
    pub fn open(config: RaftConfig, members: Vec<Member>, mode: StartMode) -> Result<Self> {
        let tick_interval = config.tick_interval();
        let storage = RaftStorage::open(config.data_dir.join(&config.node_id))?;
        let server = RaftServer::new(config, storage, members, mode)?;
        Ok(Self::new(server, tick_interval))
    }

    /// Ships outbound messages and newly committed entries.
    fn dispatch(&mut self) {
        let outbox = self.server.take_outbox();
        match &self.network_addr {
            Some(network_addr) => {
                for envelope in outbox {
                    network_addr.do_send(SendRaftMessage {
                        from: envelope.from,
                        to: envelope.to,
                        message: envelope.message,
                    });
                }
            }
            None if !outbox.is_empty() => {
                tracing::debug!(
                    "Node {} has no network, dropping {} messages",
                    self.server.id(),
                    outbox.len()
                );
            }
            None => {}
        }

        let entries = self.server.take_committed();
        if entries.is_empty() {
            return;
        }
        if let Some(listener) = &self.commit_listener {
            listener.do_send(CommittedEntries {
                member: self.server.id().clone(),
                entries,
            });
        }
    }
}

// Handler implementations

impl Handler<SetNetworkAddress> for RaftActor {
    type Result = ();

    fn handle(&mut self, msg: SetNetworkAddress, _ctx: &mut Context<Self>) -> Self::Result {
        self.network_addr = Some(msg.addr);
    }
}

impl Handler<SetCommitListener> for RaftActor {
    type Result = ();

    fn handle(&mut self, msg: SetCommitListener, _ctx: &mut Context<Self>) -> Self::Result {
        self.commit_listener = Some(msg.addr);
    }
}

impl Handler<HandleRaftMessage> for RaftActor {
    type Result = ();

    fn handle(&mut self, msg: HandleRaftMessage, _ctx: &mut Context<Self>) -> Self::Result {
        self.server.handle(msg.from, msg.message);
        self.dispatch();
    }
}

impl Handler<SubmitEntry> for RaftActor {
    type Result = MessageResult<SubmitEntry>;

    fn handle(&mut self, msg: SubmitEntry, _ctx: &mut Context<Self>) -> Self::Result {
        let handle = self.server.append(msg.entry);
        self.dispatch();
        MessageResult(handle)
    }
}

impl Handler<Join> for RaftActor {
    type Result = MessageResult<Join>;

    fn handle(&mut self, msg: Join, _ctx: &mut Context<Self>) -> Self::Result {
        let handle = self.server.join(msg.member);
        self.dispatch();
        MessageResult(handle)
    }
}

impl Handler<Leave> for RaftActor {
    type Result = MessageResult<Leave>;

    fn handle(&mut self, msg: Leave, _ctx: &mut Context<Self>) -> Self::Result {
        let handle = self.server.leave(msg.member_id);
        self.dispatch();
        MessageResult(handle)
    }
}

impl Handler<ForceConfigure> for RaftActor {
    type Result = MessageResult<ForceConfigure>;

    fn handle(&mut self, msg: ForceConfigure, _ctx: &mut Context<Self>) -> Self::Result {
        let handle = self.server.force_configure(msg.members);
        self.dispatch();
        MessageResult(handle)
    }
}

impl Handler<TakeSnapshot> for RaftActor {
    type Result = Result<SnapshotMeta>;

    fn handle(&mut self, msg: TakeSnapshot, _ctx: &mut Context<Self>) -> Self::Result {
        self.server.take_snapshot(msg.index, &msg.data)
    }
}

impl Handler<GetState> for RaftActor {
    type Result = RaftStateInfo;

    fn handle(&mut self, _msg: GetState, _ctx: &mut Context<Self>) -> Self::Result {
        self.server.info()
    }
}

impl Handler<Shutdown> for RaftActor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Context<Self>) -> Self::Result {
        if let Some(handle) = self.tick_handle.take() {
            ctx.cancel_future(handle);
        }
        self.server.shutdown();
        ctx.stop();
    }
}
