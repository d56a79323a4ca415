use super::types::{LogIndex, NodeId, Term};
use std::collections::HashSet;

/// The roles a Raft member can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not participating: before start, after leaving, or after a fatal error
    Inactive,
    /// Passive member - replicates but never votes or campaigns
    Passive,
    /// Follower state - receives updates from leader
    Follower,
    /// Candidate state - requesting votes for leadership
    Candidate,
    /// Leader state - manages log replication
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Inactive => write!(f, "Inactive"),
            NodeState::Passive => write!(f, "Passive"),
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// Term, vote and role bookkeeping of a member
#[derive(Debug, Clone)]
pub struct RaftState {
    // Persistent state on all servers
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,
    /// Index of highest log entry handed to the application
    pub last_applied: LogIndex,
    /// Current role of this node
    pub state: NodeState,
    /// ID of the current leader (if known)
    pub current_leader: Option<NodeId>,
    /// This node's ID
    pub node_id: NodeId,
    /// Caught up with the commit index the cluster had when this member (re)started
    pub ready: bool,

    // Election state for candidates
    /// Set of nodes that voted for this candidate in current election
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            state: NodeState::Inactive,
            current_leader: None,
            node_id,
            ready: false,
            votes_received: HashSet::new(),
        }
    }

    /// Transition to follower state, keeping the vote if the term does not change
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if self.state != NodeState::Follower || term != self.current_term {
            tracing::info!(
                "Node {} transitioning to Follower (term: {})",
                self.node_id,
                term
            );
        }
        if term != self.current_term {
            self.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.current_term = term;
        self.current_leader = leader;
        self.votes_received.clear();
    }

    pub fn become_passive(&mut self, term: Term, leader: Option<NodeId>) {
        if self.state != NodeState::Passive {
            tracing::info!(
                "Node {} transitioning to Passive (term: {})",
                self.node_id,
                term
            );
        }
        if term != self.current_term {
            self.voted_for = None;
        }
        self.state = NodeState::Passive;
        self.current_term = term;
        self.current_leader = leader;
        self.votes_received.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id.clone());

        tracing::info!(
            "Node {} transitioning to Candidate (term: {})",
            self.node_id,
            self.current_term
        );
    }

    /// Transition to leader state
    pub fn become_leader(&mut self) {
        tracing::info!(
            "Node {} transitioning to Leader (term: {})",
            self.node_id,
            self.current_term
        );

        self.state = NodeState::Leader;
        self.current_leader = Some(self.node_id.clone());
        self.votes_received.clear();
    }

    pub fn become_inactive(&mut self) {
        if self.state != NodeState::Inactive {
            tracing::info!(
                "Node {} transitioning to Inactive (term: {})",
                self.node_id,
                self.current_term
            );
        }
        self.state = NodeState::Inactive;
        self.current_leader = None;
        self.votes_received.clear();
    }

    /// Add a vote for this node
    pub fn add_vote(&mut self, from: NodeId) {
        self.votes_received.insert(from);
    }

    /// Moves to `term` if it is newer, as a follower without a known leader.
    /// Returns true if the term changed.
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            tracing::info!(
                "Node {} updating term from {} to {}",
                self.node_id,
                self.current_term,
                term
            );
            match self.state {
                NodeState::Inactive | NodeState::Passive => {
                    self.current_term = term;
                    self.voted_for = None;
                    self.current_leader = None;
                }
                _ => self.become_follower(term, None),
            }
            true
        } else {
            false
        }
    }

    /// Check if we're the leader
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Check if we're a candidate
    pub fn is_candidate(&self) -> bool {
        self.state == NodeState::Candidate
    }

    /// Check if we're a follower
    pub fn is_follower(&self) -> bool {
        self.state == NodeState::Follower
    }

    pub fn is_inactive(&self) -> bool {
        self.state == NodeState::Inactive
    }
}
