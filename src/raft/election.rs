use rand::Rng;

use super::log::LeaderState;
use super::rpc::{ConfigureRequest, RaftMessage, RequestVoteRequest, RequestVoteResponse};
use super::server::RaftServer;
use super::types::{EntryPayload, LogEntry, LogIndex, NodeId, Term};
use crate::util::errors::Result;

/// Draws election timeouts.
///
/// A member below the cluster's target priority waits longer: the drawn base
/// timeout is stretched by `2 * (target - priority) / target`, so the highest
/// priority members usually time out, and win, first.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
}

impl ElectionTimer {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn next_timeout<R: Rng + ?Sized>(&self, rng: &mut R, priority: u32, target: u32) -> u64 {
        let base = if self.max_ms > self.min_ms {
            rng.gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        let target = u64::from(target.max(1));
        let priority = u64::from(priority).min(target);
        base + base * 2 * (target - priority) / target
    }
}

/// Raft's "at least as up-to-date" rule
pub fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    own_last_term: Term,
    own_last_index: LogIndex,
) -> bool {
    candidate_last_term > own_last_term
        || (candidate_last_term == own_last_term && candidate_last_index >= own_last_index)
}

impl RaftServer {
    /// Members that may campaign: voters that are not waiting to catch up.
    pub(super) fn can_campaign(&self) -> bool {
        self.configuration.is_voter(&self.id) && (!self.gated || self.state.ready)
    }

    pub(super) fn on_election_timeout(&mut self) -> Result<()> {
        self.reset_election_timer();
        if !self.can_campaign() {
            tracing::debug!(
                "Node {} ignoring election timeout (voter: {}, gated: {}, ready: {})",
                self.id,
                self.configuration.is_voter(&self.id),
                self.gated,
                self.state.ready
            );
            return Ok(());
        }
        self.start_election()
    }

    fn start_election(&mut self) -> Result<()> {
        self.state.become_candidate();
        self.persist_vote()?;

        let request = RequestVoteRequest {
            term: self.state.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        tracing::info!(
            "Node {} starting election for term {} (last log index: {}, last log term: {})",
            self.id,
            request.term,
            request.last_log_index,
            request.last_log_term
        );

        let votes = &self.state.votes_received;
        if self.configuration.has_quorum(|id| votes.contains(id)) {
            return self.become_leader();
        }
        for voter in self.configuration.voters() {
            if voter != self.id {
                self.send(&voter, RaftMessage::RequestVote(request.clone()));
            }
        }
        Ok(())
    }

    /// Handle incoming RequestVote RPC
    pub(super) fn handle_request_vote(
        &mut self,
        from: NodeId,
        request: RequestVoteRequest,
    ) -> Result<()> {
        // Members outside the configuration never disturb the term
        if !self.configuration.is_voter(&request.candidate_id) {
            tracing::debug!(
                "Node {} denied vote to {} - not a voting member",
                self.id,
                request.candidate_id
            );
            if self.state.is_leader() && !self.committed_configuration.contains(&from) {
                let configure = ConfigureRequest {
                    term: self.state.current_term,
                    leader_id: self.id.clone(),
                    configuration: self.committed_configuration.clone(),
                    joint: false,
                };
                self.send(&from, RaftMessage::Configure(configure));
            }
            return self.reply_vote(&from, false);
        }

        if request.term < self.state.current_term {
            tracing::debug!(
                "Node {} denied vote to {} - request term {} < current term {}",
                self.id,
                request.candidate_id,
                request.term,
                self.state.current_term
            );
            return self.reply_vote(&from, false);
        }

        self.observe_term(request.term)?;

        if !self.configuration.is_voter(&self.id) {
            return self.reply_vote(&from, false);
        }
        if self.gated && !self.state.ready {
            tracing::debug!(
                "Node {} denied vote to {} - still catching up",
                self.id,
                request.candidate_id
            );
            return self.reply_vote(&from, false);
        }
        if self.state.is_leader() {
            return self.reply_vote(&from, false);
        }

        let can_vote = self.state.voted_for.is_none()
            || self.state.voted_for.as_ref() == Some(&request.candidate_id);
        if !can_vote {
            tracing::debug!(
                "Node {} denied vote to {} - already voted for {:?}",
                self.id,
                request.candidate_id,
                self.state.voted_for
            );
            return self.reply_vote(&from, false);
        }

        if !is_log_up_to_date(
            request.last_log_term,
            request.last_log_index,
            self.last_log_term(),
            self.last_log_index(),
        ) {
            tracing::debug!(
                "Node {} denied vote to {} - log not up-to-date",
                self.id,
                request.candidate_id
            );
            return self.reply_vote(&from, false);
        }

        self.state.voted_for = Some(request.candidate_id.clone());
        self.persist_vote()?;
        self.reset_election_timer();
        tracing::info!(
            "Node {} granted vote to {} in term {}",
            self.id,
            request.candidate_id,
            request.term
        );
        self.reply_vote(&from, true)
    }

    fn reply_vote(&mut self, to: &NodeId, vote_granted: bool) -> Result<()> {
        let response = RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        };
        self.send(to, RaftMessage::RequestVoteResponse(response));
        Ok(())
    }

    /// Handle incoming RequestVote response
    pub(super) fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: RequestVoteResponse,
    ) -> Result<()> {
        if self.observe_term(response.term)? {
            return Ok(());
        }
        // Ignore if we're not a candidate anymore, or the response is stale
        if !self.state.is_candidate() || response.term < self.state.current_term {
            return Ok(());
        }
        if !response.vote_granted {
            return Ok(());
        }

        self.state.add_vote(from.clone());
        tracing::debug!(
            "Node {} received vote from {} ({} votes in term {})",
            self.id,
            from,
            self.state.votes_received.len(),
            self.state.current_term
        );

        let votes = &self.state.votes_received;
        if self.configuration.has_quorum(|id| votes.contains(id)) {
            tracing::info!(
                "Node {} won election in term {} with {} votes",
                self.id,
                self.state.current_term,
                self.state.votes_received.len()
            );
            self.become_leader()?;
        }
        Ok(())
    }

    /// Takes over the cluster: appends the leader's initial entry and starts
    /// replicating it. Nothing appended later commits before it does.
    pub(super) fn become_leader(&mut self) -> Result<()> {
        let term = self.state.current_term;
        let initial_index = self.last_log_index() + 1;
        self.log
            .append(vec![LogEntry::new(term, initial_index, EntryPayload::Initial)])?;

        self.state.become_leader();
        let mut leader = LeaderState::new(initial_index, self.now_ms);
        for member in self.configuration.replication_targets(&self.id) {
            leader.track(member, initial_index);
        }
        self.leader = Some(leader);
        self.first_commit_index.get_or_insert(initial_index);
        self.last_application = self.find_last_application()?;

        tracing::info!(
            "Node {} leading term {} with initial entry at index {}",
            self.id,
            term,
            initial_index
        );

        self.flush_log();
        self.replicate_all()?;
        self.advance_commit_index()
    }

    /// Members this node should count in elections, for status reporting.
    pub fn voters(&self) -> Vec<NodeId> {
        self.configuration.voters()
    }
}
