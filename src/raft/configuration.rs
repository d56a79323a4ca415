use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::{LogIndex, NodeId, Term};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberType {
    /// Votes and counts toward quorum
    Active,
    /// Receives replication only
    Passive,
}

/// A cluster member. Never mutated in place: membership changes produce a new `Configuration`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: NodeId,
    pub member_type: MemberType,
    /// Election priority, higher campaigns sooner
    pub priority: u32,
    /// Millisecond timestamp at which the member was added
    pub joined_at: u64,
}

impl Member {
    pub fn active(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            member_type: MemberType::Active,
            priority: 1,
            joined_at: 0,
        }
    }

    pub fn passive(id: impl Into<NodeId>) -> Self {
        Self {
            member_type: MemberType::Passive,
            ..Self::active(id)
        }
    }

    pub fn with_priority(self, priority: u32) -> Self {
        Self { priority, ..self }
    }

    pub fn joined_at(self, joined_at: u64) -> Self {
        Self { joined_at, ..self }
    }

    pub fn is_active(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

/// Versioned membership of the cluster.
///
/// While `old_members` is non-empty the configuration is joint: every quorum
/// decision needs a majority of both the old and the new active members, so
/// two disjoint majorities can never commit conflicting entries during the
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    /// Index of the entry carrying this configuration (0 for the bootstrap one)
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64,
    pub members: Vec<Member>,
    pub old_members: Vec<Member>,
    /// Installed by force-configure, outside quorum-safe reconfiguration
    pub force: bool,
}

impl Configuration {
    pub fn new(index: LogIndex, term: Term, timestamp: u64, members: Vec<Member>) -> Self {
        Self {
            index,
            term,
            timestamp,
            members,
            old_members: Vec::new(),
            force: false,
        }
    }

    /// Bootstrap configuration, known to every member before any entry exists.
    pub fn initial(members: Vec<Member>) -> Self {
        Self::new(0, 0, 0, members)
    }

    /// Transitional configuration moving from `old` to `members`.
    pub fn joint(
        index: LogIndex,
        term: Term,
        timestamp: u64,
        old: Vec<Member>,
        members: Vec<Member>,
    ) -> Self {
        Self {
            old_members: old,
            ..Self::new(index, term, timestamp, members)
        }
    }

    pub fn forced(index: LogIndex, term: Term, timestamp: u64, members: Vec<Member>) -> Self {
        Self {
            force: true,
            ..Self::new(index, term, timestamp, members)
        }
    }

    /// Orders configurations by (term, index). Forced configurations are not
    /// journal entries, so the index alone cannot order them.
    pub fn is_newer_than(&self, other: &Configuration) -> bool {
        (self.term, self.index) > (other.term, other.index)
    }

    pub fn is_joint(&self) -> bool {
        !self.old_members.is_empty()
    }

    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members
            .iter()
            .chain(self.old_members.iter())
            .find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.member(id).is_some()
    }

    /// True if `id` votes under this configuration (in either half when joint).
    pub fn is_voter(&self, id: &str) -> bool {
        self.members
            .iter()
            .chain(self.old_members.iter())
            .any(|m| m.id == id && m.is_active())
    }

    pub fn voters(&self) -> Vec<NodeId> {
        let ids: BTreeSet<&NodeId> = self
            .members
            .iter()
            .chain(self.old_members.iter())
            .filter(|m| m.is_active())
            .map(|m| &m.id)
            .collect();
        ids.into_iter().cloned().collect()
    }

    /// Every member other than `self_id` that must receive replication.
    pub fn replication_targets(&self, self_id: &str) -> Vec<NodeId> {
        let ids: BTreeSet<&NodeId> = self
            .members
            .iter()
            .chain(self.old_members.iter())
            .filter(|m| m.id != self_id)
            .map(|m| &m.id)
            .collect();
        ids.into_iter().cloned().collect()
    }

    /// Check if the members for which `granted` holds form a quorum.
    pub fn has_quorum<F>(&self, granted: F) -> bool
    where
        F: Fn(&NodeId) -> bool,
    {
        let new_ok = has_majority(&self.members, &granted);
        if self.is_joint() {
            new_ok && has_majority(&self.old_members, &granted)
        } else {
            new_ok
        }
    }

    /// Highest index acknowledged by a quorum, given each member's match index.
    pub fn quorum_index<F>(&self, match_of: F) -> LogIndex
    where
        F: Fn(&NodeId) -> LogIndex,
    {
        let new_index = majority_index(&self.members, &match_of);
        if self.is_joint() {
            new_index.min(majority_index(&self.old_members, &match_of))
        } else {
            new_index
        }
    }

    /// Size of a majority of the new active members.
    pub fn quorum_size(&self) -> usize {
        self.members.iter().filter(|m| m.is_active()).count() / 2 + 1
    }

    /// Compares member identities and types, ignoring order and metadata.
    pub fn same_members(&self, other: &[Member]) -> bool {
        member_set(&self.members) == member_set(other) && !self.is_joint()
    }

    /// Highest priority among active members; the bar every member measures itself against.
    pub fn target_priority(&self) -> u32 {
        self.members
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.priority)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn priority_of(&self, id: &str) -> Option<u32> {
        self.member(id).map(|m| m.priority)
    }

    pub(crate) fn digest(&self, crc: u32) -> u32 {
        let mut crc = crc32c::crc32c_append(crc, &self.index.to_le_bytes());
        crc = crc32c::crc32c_append(crc, &self.term.to_le_bytes());
        crc = crc32c::crc32c_append(crc, &self.timestamp.to_le_bytes());
        crc = crc32c::crc32c_append(crc, &[self.force as u8]);
        for (tag, members) in [(0u8, &self.members), (1u8, &self.old_members)] {
            for member in members {
                crc = crc32c::crc32c_append(crc, &[tag, member.member_type as u8]);
                crc = crc32c::crc32c_append(crc, member.id.as_bytes());
                crc = crc32c::crc32c_append(crc, &member.priority.to_le_bytes());
                crc = crc32c::crc32c_append(crc, &member.joined_at.to_le_bytes());
            }
        }
        crc
    }
}

fn member_set(members: &[Member]) -> BTreeSet<(&str, MemberType)> {
    members
        .iter()
        .map(|m| (m.id.as_str(), m.member_type))
        .collect()
}

fn has_majority<F>(members: &[Member], granted: &F) -> bool
where
    F: Fn(&NodeId) -> bool,
{
    let voters: Vec<&Member> = members.iter().filter(|m| m.is_active()).collect();
    if voters.is_empty() {
        return false;
    }
    let votes = voters.iter().filter(|m| granted(&m.id)).count();
    votes > voters.len() / 2
}

fn majority_index<F>(members: &[Member], match_of: &F) -> LogIndex
where
    F: Fn(&NodeId) -> LogIndex,
{
    let mut indexes: Vec<LogIndex> = members
        .iter()
        .filter(|m| m.is_active())
        .map(|m| match_of(&m.id))
        .collect();
    if indexes.is_empty() {
        return 0;
    }
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    indexes[indexes.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn members(ids: &[&str]) -> Vec<Member> {
        ids.iter().map(|id| Member::active(*id)).collect()
    }

    #[test]
    fn test_quorum_index_simple_majority() {
        let config = Configuration::initial(members(&["a", "b", "c"]));
        let matches: HashMap<&str, LogIndex> = [("a", 10), ("b", 7), ("c", 3)].into();

        assert_eq!(config.quorum_index(|id| matches[id.as_str()]), 7);
    }

    #[test]
    fn test_joint_quorum_needs_both_halves() {
        let config = Configuration::joint(
            5,
            2,
            0,
            members(&["a", "b", "c"]),
            members(&["a", "d", "e"]),
        );
        let matches: HashMap<&str, LogIndex> =
            [("a", 9), ("b", 9), ("c", 9), ("d", 4), ("e", 2)].into();

        // Old half agrees on 9, new half only on 4
        assert_eq!(config.quorum_index(|id| matches[id.as_str()]), 4);
        assert!(!config.has_quorum(|id| matches[id.as_str()] >= 9));
        assert!(config.has_quorum(|id| matches[id.as_str()] >= 4));
    }

    #[test]
    fn test_passive_members_do_not_count() {
        let mut list = members(&["a", "b"]);
        list.push(Member::passive("p"));
        let config = Configuration::initial(list);

        assert!(!config.is_voter("p"));
        assert_eq!(config.voters(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.replication_targets("a"), vec!["b".to_string(), "p".to_string()]);
        assert!(!config.has_quorum(|id| id == "a" || id == "p"));
        assert!(config.has_quorum(|id| id == "a" || id == "b"));
    }

    #[test]
    fn test_same_members_ignores_order() {
        let config = Configuration::initial(members(&["a", "b", "c"]));
        assert!(config.same_members(&members(&["c", "a", "b"])));
        assert!(!config.same_members(&members(&["a", "b"])));
    }

    #[test]
    fn test_forced_configuration_orders_by_term() {
        let entry = Configuration::new(40, 3, 0, members(&["a", "b", "c"]));
        let forced = Configuration::forced(12, 4, 0, members(&["a"]));
        assert!(forced.is_newer_than(&entry));
        assert!(!entry.is_newer_than(&forced));
    }

    #[test]
    fn test_target_priority() {
        let config = Configuration::initial(vec![
            Member::active("a").with_priority(3),
            Member::active("b").with_priority(1),
            Member::passive("c").with_priority(9),
        ]);
        assert_eq!(config.target_priority(), 3);
        assert_eq!(config.priority_of("b"), Some(1));
    }
}
