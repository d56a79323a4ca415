use std::collections::BTreeMap;

use crate::raft::types::{LogEntry, LogIndex, NodeId, Term};
use crate::raft::RaftServer;
use crate::storage::LogStorage;
use crate::util::errors::{RaftError, Result};

/// Cross-member safety checks, fed from what members expose publicly.
///
/// Keeps one leader per term and one committed entry per index across the
/// whole cluster. Meant for tests and offline verification; members never
/// consult it.
#[derive(Debug, Default)]
pub struct ClusterAuditor {
    leaders: BTreeMap<Term, NodeId>,
    // Index -> (term, checksum, first member that reported it)
    committed: BTreeMap<LogIndex, (Term, u32, NodeId)>,
}

impl ClusterAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one leader per term.
    pub fn record_leader(&mut self, term: Term, member: &NodeId) -> Result<()> {
        match self.leaders.get(&term) {
            Some(existing) if existing != member => Err(RaftError::ProtocolViolation(format!(
                "term {} has two leaders: {} and {}",
                term, existing, member
            ))),
            Some(_) => Ok(()),
            None => {
                self.leaders.insert(term, member.clone());
                Ok(())
            }
        }
    }

    /// Every member commits the same entry at a given index.
    pub fn record_committed(&mut self, member: &NodeId, entry: &LogEntry) -> Result<()> {
        if !entry.verify() {
            return Err(RaftError::ProtocolViolation(format!(
                "{} committed entry {} with a bad checksum",
                member, entry.index
            )));
        }
        match self.committed.get(&entry.index) {
            Some((term, checksum, first)) if *term != entry.term || *checksum != entry.checksum => {
                Err(RaftError::ProtocolViolation(format!(
                    "{} committed entry {} of term {}, but {} committed term {}",
                    member, entry.index, entry.term, first, term
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.committed
                    .insert(entry.index, (entry.term, entry.checksum, member.clone()));
                Ok(())
            }
        }
    }

    /// Records the member's role and hands back what it committed since the
    /// last call, after checking it.
    pub fn observe(&mut self, server: &mut RaftServer) -> Result<Vec<LogEntry>> {
        let member = server.id().clone();
        if server.is_leader() {
            self.record_leader(server.term(), &member)?;
        }
        let entries = server.take_committed();
        for entry in &entries {
            self.record_committed(&member, entry)?;
        }
        Ok(entries)
    }

    /// The journal holds every index between its first and last one.
    pub fn check_gap_free(log: &dyn LogStorage) -> Result<()> {
        if log.is_empty() {
            return Ok(());
        }
        let first = log.first_index();
        let last = log.last_index();
        let entries = log.get_range(first, last)?;
        let mut expected = first;
        for entry in &entries {
            if entry.index != expected {
                return Err(RaftError::ProtocolViolation(format!(
                    "journal gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        if expected != last + 1 {
            return Err(RaftError::ProtocolViolation(format!(
                "journal gap: entries end at {}, last index is {}",
                expected - 1,
                last
            )));
        }
        Ok(())
    }

    pub fn leaders(&self) -> &BTreeMap<Term, NodeId> {
        &self.leaders
    }

    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }
}
