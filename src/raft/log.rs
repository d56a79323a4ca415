use futures::channel::oneshot;
use std::collections::BTreeMap;

use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, RaftMessage};
use super::server::RaftServer;
use super::snapshot::InstallProgress;
use super::types::{ApplicationEntry, LogEntry, LogIndex, NodeId};
use crate::util::errors::{RaftError, Result};

/// Final result of an append.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The entry never made it into the journal
    WriteFailed(RaftError),
    Committed(LogIndex),
    /// The entry was written but this member lost leadership before it
    /// committed. A later leader may still commit it.
    CommitFailed(LogIndex, RaftError),
}

/// Completion handles of one append.
///
/// `written` resolves once the entry is flushed on the leader, `outcome` once
/// it commits or definitely fails.
pub struct AppendHandle {
    pub index: Option<LogIndex>,
    pub written: oneshot::Receiver<LogIndex>,
    pub outcome: oneshot::Receiver<AppendOutcome>,
}

impl AppendHandle {
    fn failed(error: RaftError) -> Self {
        let (_, written) = oneshot::channel();
        let (sender, outcome) = oneshot::channel();
        let _ = sender.send(AppendOutcome::WriteFailed(error));
        Self {
            index: None,
            written,
            outcome,
        }
    }

    /// Index the entry was flushed at, if that already happened.
    pub fn try_written(&mut self) -> Option<LogIndex> {
        self.written.try_recv().ok().flatten()
    }

    /// The outcome, if it is already decided.
    pub fn try_outcome(&mut self) -> Option<AppendOutcome> {
        self.outcome.try_recv().ok().flatten()
    }

    pub async fn wait(self) -> AppendOutcome {
        let index = self.index;
        self.outcome.await.unwrap_or_else(|_| {
            let error = RaftError::Rejected("member stopped".to_string());
            match index {
                Some(index) => AppendOutcome::CommitFailed(index, error),
                None => AppendOutcome::WriteFailed(error),
            }
        })
    }
}

/// Checks an application entry against the previous one before the leader
/// appends it.
pub trait EntryValidator: Send {
    fn validate(
        &self,
        previous: Option<&ApplicationEntry>,
        entry: &ApplicationEntry,
    ) -> std::result::Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEntryValidator;

impl EntryValidator for NoopEntryValidator {
    fn validate(
        &self,
        _previous: Option<&ApplicationEntry>,
        _entry: &ApplicationEntry,
    ) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Requires entries to cover contiguous, non-overlapping position ranges.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionValidator;

impl EntryValidator for PositionValidator {
    fn validate(
        &self,
        previous: Option<&ApplicationEntry>,
        entry: &ApplicationEntry,
    ) -> std::result::Result<(), String> {
        if entry.lowest_position > entry.highest_position {
            return Err(format!(
                "lowest position {} above highest position {}",
                entry.lowest_position, entry.highest_position
            ));
        }
        if let Some(previous) = previous {
            if entry.lowest_position != previous.highest_position + 1 {
                return Err(format!(
                    "expected lowest position {}, got {}",
                    previous.highest_position + 1,
                    entry.lowest_position
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct InFlight {
    pub(super) request_id: u64,
    pub(super) sent_at_ms: u64,
}

/// What the leader knows about one member.
#[derive(Debug, Clone)]
pub(super) struct MemberProgress {
    pub(super) next_index: LogIndex,
    pub(super) match_index: LogIndex,
    pub(super) snapshot_index: LogIndex,
    pub(super) configuration_index: LogIndex,
    /// At most one append request is outstanding per member
    pub(super) in_flight: Option<InFlight>,
    pub(super) install: Option<InstallProgress>,
    pub(super) last_response_ms: Option<u64>,
    pub(super) failures: u32,
}

impl MemberProgress {
    fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: 0,
            snapshot_index: 0,
            configuration_index: 0,
            in_flight: None,
            install: None,
            last_response_ms: None,
            failures: 0,
        }
    }
}

/// Volatile state of a leader, dropped when leadership ends.
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub(super) progress: BTreeMap<NodeId, MemberProgress>,
    /// Index of this leader's initial entry
    pub(super) initial_index: LogIndex,
    pub(super) elected_at_ms: u64,
    pub(super) next_heartbeat_ms: u64,
}

impl LeaderState {
    pub(super) fn new(initial_index: LogIndex, now_ms: u64) -> Self {
        Self {
            progress: BTreeMap::new(),
            initial_index,
            elected_at_ms: now_ms,
            next_heartbeat_ms: now_ms,
        }
    }

    pub(super) fn track(&mut self, member: NodeId, next_index: LogIndex) {
        self.progress
            .entry(member)
            .or_insert_with(|| MemberProgress::new(next_index));
    }
}

impl RaftServer {
    /// Appends an application entry. Only the leader accepts entries.
    pub fn append(&mut self, entry: ApplicationEntry) -> AppendHandle {
        if !self.state.is_leader() || self.leader.is_none() {
            return AppendHandle::failed(RaftError::NotLeader {
                leader: self.state.current_leader.clone(),
            });
        }
        if let Err(reason) = self
            .validator
            .validate(self.last_application.as_ref(), &entry)
        {
            tracing::warn!(
                "Node {} rejected entry for positions {}..={}: {}",
                self.id,
                entry.lowest_position,
                entry.highest_position,
                reason
            );
            return AppendHandle::failed(RaftError::Rejected(reason));
        }

        let index = self.log.last_index() + 1;
        let log_entry = LogEntry::application(self.state.current_term, index, entry.clone());
        if let Err(e) = self.log.append(vec![log_entry]) {
            tracing::warn!("Node {} failed to append entry {}: {}", self.id, index, e);
            return AppendHandle::failed(e);
        }
        self.last_application = Some(entry);

        let (written_sender, written) = oneshot::channel();
        let (outcome_sender, outcome) = oneshot::channel();
        self.pending_writes.insert(index, written_sender);
        self.pending_commits.insert(index, outcome_sender);
        tracing::debug!("Node {} appended entry {}", self.id, index);

        self.flush_log();
        if let Err(e) = self.replicate_all().and_then(|_| self.advance_commit_index()) {
            self.on_error(e);
        }
        AppendHandle {
            index: Some(index),
            written,
            outcome,
        }
    }

    /// Flushes the journal and completes write handles it covers. A failed
    /// flush is retried on the next tick.
    pub(super) fn flush_log(&mut self) -> bool {
        if self.log.last_flushed_index() < self.log.last_index() {
            if let Err(e) = self.log.flush() {
                tracing::warn!(
                    "Node {} failed to flush journal up to {}: {}",
                    self.id,
                    self.log.last_index(),
                    e
                );
                return false;
            }
        }
        let flushed = self.log.last_flushed_index();
        let still_pending = self.pending_writes.split_off(&(flushed + 1));
        for (index, sender) in std::mem::replace(&mut self.pending_writes, still_pending) {
            let _ = sender.send(index);
        }
        true
    }

    /// Most recent application entry in the journal.
    pub(super) fn find_last_application(&self) -> Result<Option<ApplicationEntry>> {
        let first = self.log.first_index();
        let mut index = self.log.last_index();
        while index >= first && index > 0 {
            if let Some(entry) = self.log.get(index)? {
                if let Some(application) = entry.payload.as_application() {
                    return Ok(Some(application.clone()));
                }
            }
            index -= 1;
        }
        Ok(None)
    }

    pub(super) fn replicate_all(&mut self) -> Result<()> {
        let members: Vec<NodeId> = match &self.leader {
            Some(leader) => leader.progress.keys().cloned().collect(),
            None => return Ok(()),
        };
        for member in members {
            self.replicate_to(&member)?;
        }
        Ok(())
    }

    /// Sends `member` what it needs next unless a request is outstanding.
    pub(super) fn replicate_to(&mut self, member: &NodeId) -> Result<()> {
        let Some(progress) = self.leader.as_ref().and_then(|l| l.progress.get(member)) else {
            return Ok(());
        };
        if let Some(install) = &progress.install {
            if install.in_flight.is_none() {
                return self.send_snapshot_chunk(member);
            }
            return Ok(());
        }
        if progress.in_flight.is_some() {
            return Ok(());
        }
        self.send_append(member)
    }

    /// Builds and sends the next append request for `member`.
    pub(super) fn send_append(&mut self, member: &NodeId) -> Result<()> {
        let Some(progress) = self.leader.as_ref().and_then(|l| l.progress.get(member)) else {
            return Ok(());
        };
        if self.should_send_snapshot(progress) {
            return self.start_install(member);
        }
        let next_index = progress.next_index.max(1);
        let prev_log_index = next_index - 1;
        let Some(prev_log_term) = self.term_at(prev_log_index)? else {
            // The entry before `next_index` was compacted away
            return self.start_install(member);
        };

        let last = self.log.last_index();
        let end = last.min(prev_log_index + self.config.max_append_entries as u64);
        let entries = if next_index <= end {
            self.log.get_range(next_index, end)?
        } else {
            Vec::new()
        };

        let request_id = self.next_request_id();
        let now = self.now_ms;
        if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(member)) {
            progress.in_flight = Some(InFlight {
                request_id,
                sent_at_ms: now,
            });
        }
        tracing::debug!(
            "Node {} replicating {} entries after {} to {}",
            self.id,
            entries.len(),
            prev_log_index,
            member
        );
        let request = AppendEntriesRequest {
            term: self.state.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index,
            request_id,
        };
        self.send(member, RaftMessage::AppendEntries(request));
        Ok(())
    }

    /// Handle incoming AppendEntries RPC
    pub(super) fn handle_append_entries(
        &mut self,
        from: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<()> {
        // Reply false if term < currentTerm
        if request.term < self.state.current_term {
            tracing::debug!(
                "Node {} rejected AppendEntries from {} - stale term ({} < {})",
                self.id,
                request.leader_id,
                request.term,
                self.state.current_term
            );
            let last = self.last_log_index();
            self.reply_append(&from, false, last, request.request_id);
            return Ok(());
        }
        if request.term == self.state.current_term && self.state.is_leader() {
            return Err(RaftError::ProtocolViolation(format!(
                "{} sent entries for term {}, which this member leads",
                request.leader_id, request.term
            )));
        }

        self.observe_term(request.term)?;
        if self.state.current_leader.as_ref() != Some(&request.leader_id)
            || self.state.is_candidate()
        {
            self.follow(request.term, Some(request.leader_id.clone()));
            tracing::info!(
                "Node {} following leader {} in term {}",
                self.id,
                request.leader_id,
                request.term
            );
        }
        self.reset_election_timer();
        if let Some(install) = self.install.take() {
            tracing::debug!(
                "Node {} dropping partial snapshot {}",
                self.id,
                install.meta.id()
            );
        }

        // Committed entries must survive restarts; if neither we nor the
        // leader still have them, they are gone
        if self.first_commit_index.is_none() {
            if request.leader_commit < self.stored_commit_index
                && self.log.last_flushed_index() < self.stored_commit_index
            {
                return Err(RaftError::DataLoss(format!(
                    "committed up to {} before restart, but the journal ends at {} and leader {} only committed {}",
                    self.stored_commit_index,
                    self.log.last_flushed_index(),
                    request.leader_id,
                    request.leader_commit
                )));
            }
            if request.leader_commit > 0 {
                self.first_commit_index = Some(request.leader_commit);
            }
        }

        // Check log consistency
        let prev = request.prev_log_index;
        let last = self.log.last_index();
        if prev > last {
            tracing::debug!(
                "Node {} rejected AppendEntries - missing entry at index {} (last: {})",
                self.id,
                prev,
                last
            );
            self.reply_append(&from, false, last, request.request_id);
            return Ok(());
        }
        if prev >= self.log.first_index() && prev > 0 {
            let term = self.log.get(prev)?.map(|e| e.term);
            if term != Some(request.prev_log_term) {
                tracing::debug!(
                    "Node {} rejected AppendEntries - term mismatch at index {} ({:?} != {})",
                    self.id,
                    prev,
                    term,
                    request.prev_log_term
                );
                let hint = self.state.commit_index.min(prev - 1);
                self.reply_append(&from, false, hint, request.request_id);
                return Ok(());
            }
        }

        let matched = (prev + request.entries.len() as u64).max(self.snapshot_index());
        let first = self.log.first_index();
        let mut to_append: Vec<LogEntry> = Vec::new();
        let mut truncated = false;
        for entry in request.entries {
            if !entry.verify() {
                tracing::warn!(
                    "Node {} received entry {} with a bad checksum from {}",
                    self.id,
                    entry.index,
                    from
                );
                self.reply_append(&from, false, prev, request.request_id);
                return Ok(());
            }
            if entry.index < first {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.get(entry.index)? {
                Some(existing) if existing.term == entry.term => {
                    if existing.checksum != entry.checksum {
                        return Err(RaftError::ProtocolViolation(format!(
                            "entry {} of term {} differs from the leader's copy",
                            entry.index, entry.term
                        )));
                    }
                }
                Some(existing) => {
                    if entry.index <= self.state.commit_index {
                        return Err(RaftError::ProtocolViolation(format!(
                            "leader {} replaces committed entry {} (term {} -> {})",
                            request.leader_id, entry.index, existing.term, entry.term
                        )));
                    }
                    // Conflict found, delete this entry and all that follow
                    tracing::info!(
                        "Node {} found log conflict at index {}, truncating",
                        self.id,
                        entry.index
                    );
                    self.log.truncate(entry.index)?;
                    truncated = true;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        if truncated {
            self.reload_configuration()?;
        }
        if !to_append.is_empty() {
            let configurations: Vec<_> = to_append
                .iter()
                .filter_map(|e| e.payload.as_configuration().cloned())
                .collect();
            self.log.append(to_append)?;
            for configuration in configurations {
                self.adopt_configuration(configuration);
            }
        }

        if self.log.last_flushed_index() < matched.min(self.log.last_index()) {
            if let Err(e) = self.log.flush() {
                tracing::warn!("Node {} failed to flush journal: {}", self.id, e);
                self.reply_append(&from, false, prev, request.request_id);
                return Ok(());
            }
        }

        self.set_commit_index(request.leader_commit.min(matched))?;
        self.reply_append(&from, true, matched, request.request_id);
        Ok(())
    }

    fn reply_append(&mut self, to: &NodeId, success: bool, last_log_index: LogIndex, request_id: u64) {
        let response = AppendEntriesResponse {
            term: self.state.current_term,
            success,
            last_log_index,
            last_snapshot_index: self.snapshot_index(),
            configuration_index: self.configuration.index,
            request_id,
        };
        self.send(to, RaftMessage::AppendEntriesResponse(response));
    }

    /// Handle incoming AppendEntries response
    pub(super) fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        if self.observe_term(response.term)? {
            return Ok(());
        }
        if !self.state.is_leader() || response.term < self.state.current_term {
            return Ok(());
        }

        let now = self.now_ms;
        let last_index = self.log.last_index();
        let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&from)) else {
            return Ok(());
        };
        progress.last_response_ms = Some(now);
        progress.snapshot_index = progress.snapshot_index.max(response.last_snapshot_index);
        progress.configuration_index = response.configuration_index;

        // Responses to superseded requests only ever move the member forward
        let current = progress.in_flight.map(|f| f.request_id) == Some(response.request_id);
        if current {
            progress.in_flight = None;
        }

        let mut resend = false;
        if response.success {
            progress.failures = 0;
            progress.match_index = progress.match_index.max(response.last_log_index);
            progress.next_index = progress.next_index.max(response.last_log_index + 1);
            resend = current && progress.next_index <= last_index;
        } else if current {
            progress.failures += 1;
            let next_index = response.last_log_index + 1;
            if response.last_log_index < progress.match_index {
                progress.match_index = response.last_log_index;
            }
            resend = next_index != progress.next_index;
            progress.next_index = next_index;
            tracing::debug!(
                "Node {} backing off {} to index {} ({} failures)",
                self.id,
                from,
                next_index,
                progress.failures
            );
        }

        if response.success {
            self.advance_commit_index()?;
        }
        if resend && self.state.is_leader() {
            self.send_append(&from)?;
        }
        Ok(())
    }

    /// Commits the highest index flushed by a quorum, once this leader's
    /// initial entry is among them.
    pub(super) fn advance_commit_index(&mut self) -> Result<()> {
        let Some(leader) = &self.leader else {
            return Ok(());
        };
        let own = self.log.last_flushed_index();
        let quorum_index = self.configuration.quorum_index(|id| {
            if *id == self.id {
                own
            } else {
                leader.progress.get(id).map(|p| p.match_index).unwrap_or(0)
            }
        });
        if quorum_index >= leader.initial_index && quorum_index > self.state.commit_index {
            tracing::debug!("Node {} advancing commit index to {}", self.id, quorum_index);
            self.set_commit_index(quorum_index)?;
        }
        Ok(())
    }

    pub(super) fn leader_tick(&mut self) -> Result<()> {
        if self.log.last_flushed_index() < self.log.last_index() && self.flush_log() {
            self.advance_commit_index()?;
        }
        if self.quorum_lost() {
            tracing::warn!(
                "Node {} lost contact with a quorum, stepping down in term {}",
                self.id,
                self.state.current_term
            );
            let term = self.state.current_term;
            self.abandon_leadership("quorum lost");
            self.follow(term, None);
            self.reset_election_timer();
            return Ok(());
        }

        let now = self.now_ms;
        let request_timeout = self.config.request_timeout_ms;
        let heartbeat = self.config.heartbeat_interval_ms;
        let Some(leader) = self.leader.as_mut() else {
            return Ok(());
        };
        let heartbeat_due = now >= leader.next_heartbeat_ms;
        if heartbeat_due {
            leader.next_heartbeat_ms = now + heartbeat;
        }

        let mut due = Vec::new();
        for (member, progress) in leader.progress.iter_mut() {
            if let Some(install) = progress.install.as_mut() {
                if install.timed_out(now, request_timeout) {
                    install.in_flight = None;
                    due.push(member.clone());
                } else if heartbeat_due && install.in_flight.is_none() {
                    due.push(member.clone());
                }
                continue;
            }
            let timed_out = progress
                .in_flight
                .map_or(false, |f| now >= f.sent_at_ms + request_timeout);
            if heartbeat_due || timed_out {
                progress.in_flight = None;
                due.push(member.clone());
            }
        }
        for member in due {
            self.replicate_to(&member)?;
        }
        Ok(())
    }

    fn quorum_lost(&self) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };
        let timeout = self.config.quorum_timeout_ms;
        if self.now_ms < leader.elected_at_ms + timeout {
            return false;
        }
        let now = self.now_ms;
        !self.configuration.has_quorum(|id| {
            *id == self.id
                || leader
                    .progress
                    .get(id)
                    .and_then(|p| p.last_response_ms)
                    .map_or(false, |t| now <= t + timeout)
        })
    }

    /// Tracks exactly the members the current configuration replicates to.
    pub(super) fn sync_progress(&mut self) {
        let targets = self.configuration.replication_targets(&self.id);
        let next_index = self.log.last_index() + 1;
        if let Some(leader) = self.leader.as_mut() {
            leader.progress.retain(|id, _| targets.contains(id));
            for target in targets {
                leader.track(target, next_index);
            }
        }
    }

    /// Replication state of `member` as (next index, match index), on the leader.
    pub fn member_progress(&self, member: &str) -> Option<(LogIndex, LogIndex)> {
        self.leader
            .as_ref()
            .and_then(|l| l.progress.get(member))
            .map(|p| (p.next_index, p.match_index))
    }
}
