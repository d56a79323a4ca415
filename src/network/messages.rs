use actix::prelude::*;

use crate::raft::actor::HandleRaftMessage;
use crate::raft::types::NodeId;

/// Attach a member's actor to the network
#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterMember {
    pub id: NodeId,
    pub addr: Recipient<HandleRaftMessage>,
}

/// Detach a member; messages for it are dropped afterwards
#[derive(Message)]
#[rtype(result = "()")]
pub struct RemoveMember {
    pub id: NodeId,
}

/// Split the members into isolated groups. Members not named form their own group.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Partition {
    pub groups: Vec<Vec<NodeId>>,
}

/// Remove every partition
#[derive(Message)]
#[rtype(result = "()")]
pub struct Heal;

/// Drop each message with the given probability
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetDropRate {
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Message)]
#[rtype(result = "NetworkStats")]
pub struct GetNetworkStats;

impl<A, M> actix::dev::MessageResponse<A, M> for NetworkStats
where
    A: Actor,
    M: Message<Result = NetworkStats>,
{
    fn handle(self, _ctx: &mut A::Context, tx: Option<actix::dev::OneshotSender<M::Result>>) {
        if let Some(tx) = tx {
            let _ = tx.send(self);
        }
    }
}
