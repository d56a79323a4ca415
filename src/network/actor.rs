use std::collections::HashMap;

use actix::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::codec::{MessageCodec, NetworkMessage};
use super::messages::{
    GetNetworkStats, Heal, NetworkStats, Partition, RegisterMember, RemoveMember, SetDropRate,
};
use super::peer_registry::{MemberResolver, PeerRegistry};
use crate::raft::actor::{HandleRaftMessage, SendRaftMessage};
use crate::raft::types::NodeId;

/// Routes Raft messages between actors of one process.
///
/// Every message goes through the wire codec so that what a member receives
/// is exactly what a remote peer would decode. Partitions and random drops
/// simulate an unreliable network.
pub struct LocalNetwork {
    registry: PeerRegistry<Recipient<HandleRaftMessage>>,
    codec: MessageCodec,
    // Member -> partition group; members in different groups cannot talk
    groups: HashMap<NodeId, usize>,
    drop_rate: f64,
    rng: StdRng,
    stats: NetworkStats,
}

impl Actor for LocalNetwork {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("Local network started");
    }
}

impl LocalNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            registry: PeerRegistry::new(),
            codec: MessageCodec::default(),
            groups: HashMap::new(),
            drop_rate: 0.0,
            rng: StdRng::seed_from_u64(seed),
            stats: NetworkStats::default(),
        }
    }

    fn can_reach(&self, from: &NodeId, to: &NodeId) -> bool {
        if self.groups.is_empty() {
            return true;
        }
        match (self.groups.get(from), self.groups.get(to)) {
            (Some(a), Some(b)) => a == b,
            // An unnamed member is alone in its group
            _ => from == to,
        }
    }

    fn route(&mut self, msg: SendRaftMessage) {
        if !self.can_reach(&msg.from, &msg.to) {
            self.stats.dropped += 1;
            tracing::trace!("Partitioned: dropping message {} -> {}", msg.from, msg.to);
            return;
        }
        if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
            self.stats.dropped += 1;
            return;
        }
        let Some(recipient) = self.registry.resolve(&msg.to) else {
            self.stats.dropped += 1;
            tracing::debug!("Unknown member {}, dropping message from {}", msg.to, msg.from);
            return;
        };

        let wire = NetworkMessage {
            from: msg.from,
            to: msg.to,
            message: msg.message,
        };
        let decoded = match self
            .codec
            .encode(&wire)
            .and_then(|frame| self.codec.decode(&frame))
        {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!("Failed to encode message {} -> {}: {}", wire.from, wire.to, e);
                return;
            }
        };

        self.stats.delivered += 1;
        recipient.do_send(HandleRaftMessage {
            from: decoded.from,
            message: decoded.message,
        });
    }
}

impl Handler<SendRaftMessage> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, msg: SendRaftMessage, _ctx: &mut Context<Self>) -> Self::Result {
        self.route(msg);
    }
}

impl Handler<RegisterMember> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, msg: RegisterMember, _ctx: &mut Context<Self>) -> Self::Result {
        tracing::info!("Registered member {}", msg.id);
        self.registry.register(msg.id, msg.addr);
    }
}

impl Handler<RemoveMember> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, msg: RemoveMember, _ctx: &mut Context<Self>) -> Self::Result {
        if self.registry.remove(&msg.id).is_some() {
            tracing::info!("Removed member {}", msg.id);
        }
    }
}

impl Handler<Partition> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, msg: Partition, _ctx: &mut Context<Self>) -> Self::Result {
        self.groups.clear();
        for (group, members) in msg.groups.into_iter().enumerate() {
            for member in members {
                self.groups.insert(member, group);
            }
        }
        tracing::info!("Network partitioned into {:?}", self.groups);
    }
}

impl Handler<Heal> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, _msg: Heal, _ctx: &mut Context<Self>) -> Self::Result {
        self.groups.clear();
        tracing::info!("Network healed");
    }
}

impl Handler<SetDropRate> for LocalNetwork {
    type Result = ();

    fn handle(&mut self, msg: SetDropRate, _ctx: &mut Context<Self>) -> Self::Result {
        self.drop_rate = msg.rate.clamp(0.0, 1.0);
    }
}

impl Handler<GetNetworkStats> for LocalNetwork {
    type Result = NetworkStats;

    fn handle(&mut self, _msg: GetNetworkStats, _ctx: &mut Context<Self>) -> Self::Result {
        self.stats
    }
}
