// src/network/mod.rs
pub mod actor;
pub mod codec;
pub mod messages;
pub mod peer_registry;

// Re-export the main network types for easy access from outside the network module
pub use actor::LocalNetwork;
pub use codec::{MessageCodec, NetworkMessage, MAX_MESSAGE_SIZE};
pub use messages::{
    GetNetworkStats, Heal, NetworkStats, Partition, RegisterMember, RemoveMember, SetDropRate,
};
pub use peer_registry::{MemberResolver, PeerRegistry};
