use crate::raft::types::NodeId;
use std::collections::HashMap;

/// Finds the endpoint a member is reachable at.
pub trait MemberResolver {
    type Endpoint;

    fn resolve(&self, member: &NodeId) -> Option<Self::Endpoint>;
}

/// Maps Raft member ids to endpoints
pub struct PeerRegistry<E> {
    endpoints: HashMap<NodeId, E>,
}

impl<E: Clone> PeerRegistry<E> {
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
        }
    }

    /// Register (or replace) the endpoint of a member
    pub fn register(&mut self, node_id: NodeId, endpoint: E) {
        self.endpoints.insert(node_id, endpoint);
    }

    /// Remove a member from registry
    pub fn remove(&mut self, node_id: &NodeId) -> Option<E> {
        self.endpoints.remove(node_id)
    }

    /// Get all registered node IDs, sorted
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check if a node is registered
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.endpoints.contains_key(node_id)
    }
}

impl<E: Clone> MemberResolver for PeerRegistry<E> {
    type Endpoint = E;

    fn resolve(&self, member: &NodeId) -> Option<E> {
        self.endpoints.get(member).cloned()
    }
}

impl<E: Clone> Default for PeerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
