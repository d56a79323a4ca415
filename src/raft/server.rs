use futures::channel::oneshot;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};

use super::configuration::{Configuration, Member};
use super::election::ElectionTimer;
use super::log::{AppendOutcome, EntryValidator, LeaderState, NoopEntryValidator};
use super::reconfigure::{ForwardedRequest, PendingForceConfigure, PendingReconfiguration};
use super::rpc::{Envelope, RaftMessage};
use super::snapshot::PendingInstall;
use super::state::{NodeState, RaftState};
use super::types::{ApplicationEntry, LogEntry, LogIndex, NodeId, Term};
use crate::config::RaftConfig;
use crate::storage::{LogStorage, RaftStorage, SnapshotMeta, SnapshotStore, StateStorage};
use crate::util::errors::{RaftError, Result};

/// How a member enters the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Fresh cluster, or restart with the local state intact
    Bootstrap,
    /// New member; the given members are only used as contact points
    Join,
    /// Restart after the local state was lost. The member neither votes nor
    /// campaigns until it has caught up with the cluster's commit index.
    Recover,
}

/// Snapshot of a member's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStateInfo {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub current_leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub configuration_index: LogIndex,
    pub ready: bool,
}

/// One member of a Raft group.
///
/// The server never performs I/O on the network and never reads a clock: it
/// consumes messages through [`RaftServer::handle`] and logical time through
/// [`RaftServer::tick`], and leaves outbound messages in an outbox. All state
/// changes therefore happen on whatever single task drives it.
pub struct RaftServer {
    pub(super) id: NodeId,
    pub(super) config: RaftConfig,
    pub(super) state: RaftState,
    pub(super) log: Box<dyn LogStorage>,
    pub(super) meta: Box<dyn StateStorage>,
    pub(super) snapshots: Box<dyn SnapshotStore>,
    /// Latest known configuration, possibly not committed yet
    pub(super) configuration: Configuration,
    pub(super) committed_configuration: Configuration,
    /// Whether this member ever appeared in a configuration
    pub(super) was_member: bool,
    pub(super) validator: Box<dyn EntryValidator>,
    pub(super) last_application: Option<ApplicationEntry>,
    pub(super) rng: StdRng,
    pub(super) timer: ElectionTimer,
    pub(super) now_ms: u64,
    pub(super) election_deadline_ms: u64,
    pub(super) leader: Option<LeaderState>,
    pub(super) pending_writes: BTreeMap<LogIndex, oneshot::Sender<LogIndex>>,
    pub(super) pending_commits: BTreeMap<LogIndex, oneshot::Sender<AppendOutcome>>,
    pub(super) install: Option<PendingInstall>,
    pub(super) reconfiguration: Option<PendingReconfiguration>,
    pub(super) forwarded: BTreeMap<u64, ForwardedRequest>,
    pub(super) force: Option<PendingForceConfigure>,
    pub(super) pending_compaction: Option<LogIndex>,
    pub(super) gated: bool,
    pub(super) first_commit_index: Option<LogIndex>,
    pub(super) stored_commit_index: LogIndex,
    pub(super) committed: VecDeque<LogEntry>,
    pub(super) outbox: Vec<Envelope>,
    pub(super) next_request_id: u64,
    pub(super) fatal: Option<RaftError>,
}

impl RaftServer {
    /// Opens a member on top of `storage`.
    ///
    /// Fails with [`RaftError::Corruption`] when the persisted state cannot be
    /// trusted; such a member must not take part in the cluster.
    pub fn new(
        config: RaftConfig,
        storage: RaftStorage,
        members: Vec<Member>,
        mode: StartMode,
    ) -> Result<Self> {
        config.validate().map_err(RaftError::InvalidConfig)?;
        let RaftStorage {
            mut log,
            state: mut meta,
            snapshots,
        } = storage;
        let id = config.node_id.clone();

        log.verify_integrity()?;
        let persisted = meta.load_state()?;
        let snapshot = snapshots.latest_meta();

        if let Some(snapshot) = &snapshot {
            if log.last_index() < snapshot.index {
                log.reset(snapshot.index + 1)?;
            } else if log.first_index() <= snapshot.index {
                log.compact(snapshot.index)?;
            }
        }
        let snapshot_index = snapshot.as_ref().map(|s| s.index).unwrap_or(0);
        let snapshot_term = snapshot.as_ref().map(|s| s.term).unwrap_or(0);

        let mut state = RaftState::new(id.clone());
        state.current_term = persisted.current_term.max(log.last_term()).max(snapshot_term);
        if state.current_term != persisted.current_term {
            tracing::info!(
                "Node {} restored term {} from the journal (stored term {})",
                id,
                state.current_term,
                persisted.current_term
            );
            meta.save_term(state.current_term)?;
            meta.save_voted_for(None)?;
        } else {
            state.voted_for = persisted.voted_for.clone();
        }
        state.commit_index = persisted.commit_index.max(snapshot_index);
        state.last_applied = snapshot_index;

        let mut committed_configuration = Configuration::initial(members);
        let stored = [
            persisted.configuration.clone(),
            snapshot.as_ref().and_then(|s| s.configuration.clone()),
        ];
        for candidate in stored.into_iter().flatten() {
            if candidate.is_newer_than(&committed_configuration) {
                committed_configuration = candidate;
            }
        }
        let mut configuration = committed_configuration.clone();
        if let Some(latest) = latest_configuration_entry(log.as_ref(), log.last_index())? {
            if latest.is_newer_than(&configuration) {
                configuration = latest;
            }
        }
        if !configuration.force && configuration.index <= state.commit_index {
            committed_configuration = configuration.clone();
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let timer = ElectionTimer::new(
            config.election_timeout_min_ms,
            config.election_timeout_max_ms,
        );

        tracing::info!(
            "Node {} opened: term={}, voted_for={:?}, last_index={}, commit_index={}, snapshot_index={}",
            id,
            state.current_term,
            state.voted_for,
            log.last_index(),
            state.commit_index,
            snapshot_index
        );

        Ok(Self {
            was_member: configuration.contains(&id),
            id,
            config,
            state,
            log,
            meta,
            snapshots,
            configuration,
            committed_configuration,
            validator: Box::new(NoopEntryValidator),
            last_application: None,
            rng,
            timer,
            now_ms: 0,
            election_deadline_ms: 0,
            leader: None,
            pending_writes: BTreeMap::new(),
            pending_commits: BTreeMap::new(),
            install: None,
            reconfiguration: None,
            forwarded: BTreeMap::new(),
            force: None,
            pending_compaction: None,
            gated: mode == StartMode::Recover,
            first_commit_index: None,
            stored_commit_index: persisted.commit_index,
            committed: VecDeque::new(),
            outbox: Vec::new(),
            next_request_id: 0,
            fatal: None,
        })
    }

    pub fn with_validator(mut self, validator: Box<dyn EntryValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Leaves INACTIVE and starts following. Committed entries still in the
    /// journal are queued for the application again.
    pub fn start(&mut self) {
        if !self.state.is_inactive() || self.fatal.is_some() {
            return;
        }
        let term = self.state.current_term;
        match self.configuration.member(&self.id) {
            Some(member) if member.is_active() => self.state.become_follower(term, None),
            _ => self.state.become_passive(term, None),
        }
        self.reset_election_timer();
        if let Err(e) = self.collect_committed() {
            self.on_error(e);
        }
        tracing::info!(
            "Node {} started as {} (configuration index {}, gated: {})",
            self.id,
            self.state.state,
            self.configuration.index,
            self.gated
        );
    }

    /// Stops the member: pending appends and reconfigurations fail.
    pub fn shutdown(&mut self) {
        self.abandon_leadership("member shut down");
        self.fail_pending_requests("member shut down");
        self.install = None;
        self.state.become_inactive();
    }

    /// Processes one inbound message.
    pub fn handle(&mut self, from: NodeId, message: RaftMessage) {
        if self.fatal.is_some() {
            return;
        }
        let inactive_allowed = matches!(
            message,
            RaftMessage::ReconfigureResponse(_) | RaftMessage::ForceConfigureResponse(_)
        );
        if self.state.is_inactive() && !inactive_allowed {
            return;
        }
        tracing::debug!("Node {} received {} from {}", self.id, message.kind(), from);

        let result = match message {
            RaftMessage::RequestVote(request) => self.handle_request_vote(from, request),
            RaftMessage::RequestVoteResponse(response) => {
                self.handle_request_vote_response(from, response)
            }
            RaftMessage::AppendEntries(request) => self.handle_append_entries(from, request),
            RaftMessage::AppendEntriesResponse(response) => {
                self.handle_append_entries_response(from, response)
            }
            RaftMessage::InstallSnapshot(request) => self.handle_install_snapshot(from, request),
            RaftMessage::InstallSnapshotResponse(response) => {
                self.handle_install_snapshot_response(from, response)
            }
            RaftMessage::Configure(request) => self.handle_configure(from, request),
            RaftMessage::ConfigureResponse(response) => {
                self.handle_configure_response(from, response)
            }
            RaftMessage::ForceConfigure(request) => self.handle_force_configure(from, request),
            RaftMessage::ForceConfigureResponse(response) => {
                self.handle_force_configure_response(from, response)
            }
            RaftMessage::Join(request) => self.handle_join(request),
            RaftMessage::Leave(request) => self.handle_leave(request),
            RaftMessage::ReconfigureResponse(response) => self.handle_reconfigure_response(response),
        };
        if let Err(e) = result {
            self.on_error(e);
        }
    }

    /// Advances logical time by one tick and fires due timers.
    pub fn tick(&mut self) {
        self.now_ms += self.config.tick_interval_ms;
        if self.fatal.is_some() {
            return;
        }
        if let Err(e) = self.on_tick() {
            self.on_error(e);
        }
    }

    fn on_tick(&mut self) -> Result<()> {
        if let Some(index) = self.pending_compaction.take() {
            self.log.compact(index)?;
            tracing::debug!("Node {} compacted journal up to {}", self.id, index);
        }
        match self.state.state {
            NodeState::Leader => self.leader_tick()?,
            NodeState::Follower | NodeState::Candidate => {
                if self.now_ms >= self.election_deadline_ms {
                    self.on_election_timeout()?;
                }
            }
            NodeState::Passive | NodeState::Inactive => {}
        }
        self.reconfigure_tick()
    }

    /// Drains messages produced since the last call.
    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains committed entries in commit order.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        self.committed.drain(..).collect()
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> NodeState {
        self.state.state
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn term(&self) -> Term {
        self.state.current_term
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.state.current_leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn committed_configuration(&self) -> &Configuration {
        &self.committed_configuration
    }

    pub fn log(&self) -> &dyn LogStorage {
        self.log.as_ref()
    }

    pub fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.snapshots.latest_meta()
    }

    pub fn fatal_error(&self) -> Option<&RaftError> {
        self.fatal.as_ref()
    }

    pub fn info(&self) -> RaftStateInfo {
        RaftStateInfo {
            node_id: self.id.clone(),
            state: self.state.state,
            current_term: self.state.current_term,
            current_leader: self.state.current_leader.clone(),
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.snapshots.snapshot_index(),
            configuration_index: self.configuration.index,
            ready: self.state.ready,
        }
    }

    pub(super) fn send(&mut self, to: &NodeId, message: RaftMessage) {
        tracing::debug!("Node {} sending {} to {}", self.id, message.kind(), to);
        self.outbox.push(Envelope {
            from: self.id.clone(),
            to: to.clone(),
            message,
        });
    }

    pub(super) fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub(super) fn on_error(&mut self, error: RaftError) {
        if error.is_fatal() {
            tracing::error!("Node {} stopping after fatal error: {}", self.id, error);
            self.abandon_leadership("member failed");
            self.fail_pending_requests("member failed");
            self.install = None;
            self.state.become_inactive();
            self.fatal = Some(error);
        } else {
            tracing::warn!("Node {} failed to process request: {}", self.id, error);
        }
    }

    pub(super) fn persist_vote(&mut self) -> Result<()> {
        self.meta.save_term(self.state.current_term)?;
        self.meta.save_voted_for(self.state.voted_for.clone())
    }

    /// Adopts a newer term as follower. Returns true if the term changed.
    pub(super) fn observe_term(&mut self, term: Term) -> Result<bool> {
        if term <= self.state.current_term {
            return Ok(false);
        }
        self.abandon_leadership("newer term observed");
        if self.state.is_inactive() {
            self.state.update_term(term);
        } else {
            self.follow(term, None);
        }
        self.persist_vote()?;
        self.reset_election_timer();
        Ok(true)
    }

    /// Follows `leader` in `term`, as follower or passive member depending on
    /// the current configuration.
    pub(super) fn follow(&mut self, term: Term, leader: Option<NodeId>) {
        if self.state.is_leader() {
            self.abandon_leadership("stepping down");
        }
        if self.configuration.is_voter(&self.id) {
            self.state.become_follower(term, leader);
        } else {
            self.state.become_passive(term, leader);
        }
    }

    /// Drops leader-only state. Appends waiting for commit fail; they may
    /// still be committed by a later leader.
    pub(super) fn abandon_leadership(&mut self, reason: &str) {
        if self.leader.take().is_none() {
            return;
        }
        tracing::info!("Node {} gives up leadership: {}", self.id, reason);
        self.pending_writes.clear();
        let leader = self.state.current_leader.clone();
        for (index, sender) in std::mem::take(&mut self.pending_commits) {
            let _ = sender.send(AppendOutcome::CommitFailed(
                index,
                RaftError::NotLeader {
                    leader: leader.clone(),
                },
            ));
        }
        if let Some(pending) = self.reconfiguration.take() {
            pending.reject(self, reason);
        }
        if self.state.is_leader() {
            self.state.current_leader = None;
        }
    }

    pub(super) fn reset_election_timer(&mut self) {
        let priority = self.configuration.priority_of(&self.id).unwrap_or(1);
        let target = self.configuration.target_priority();
        let timeout = self.timer.next_timeout(&mut self.rng, priority, target);
        self.election_deadline_ms = self.now_ms + timeout;
    }

    pub(super) fn snapshot_index(&self) -> LogIndex {
        self.snapshots.snapshot_index()
    }

    pub(super) fn last_log_index(&self) -> LogIndex {
        self.log.last_index().max(self.snapshot_index())
    }

    pub(super) fn last_log_term(&self) -> Term {
        if self.log.is_empty() {
            self.snapshots.latest_meta().map(|s| s.term).unwrap_or(0)
        } else {
            self.log.last_term()
        }
    }

    /// Term of the entry at `index`, looking through the snapshot boundary.
    pub(super) fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(entry) = self.log.get(index)? {
            return Ok(Some(entry.term));
        }
        Ok(self
            .snapshots
            .latest_meta()
            .filter(|s| s.index == index)
            .map(|s| s.term))
    }

    /// Raises the commit index, commits configurations it covers and hands
    /// newly committed entries to the application.
    pub(super) fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.state.commit_index {
            self.check_ready();
            return Ok(());
        }
        self.state.commit_index = index;
        self.meta.save_commit_index(index)?;
        self.check_configuration_commit()?;
        self.collect_committed()?;

        let still_pending = self.pending_commits.split_off(&(index + 1));
        for (committed, sender) in std::mem::replace(&mut self.pending_commits, still_pending) {
            let _ = sender.send(AppendOutcome::Committed(committed));
        }
        self.check_ready();
        Ok(())
    }

    pub(super) fn check_configuration_commit(&mut self) -> Result<()> {
        if self.configuration != self.committed_configuration
            && !self.configuration.force
            && self.configuration.index <= self.state.commit_index
        {
            self.committed_configuration = self.configuration.clone();
            self.meta.save_configuration(&self.committed_configuration)?;
            tracing::info!(
                "Node {} committed configuration at index {} (joint: {})",
                self.id,
                self.committed_configuration.index,
                self.committed_configuration.is_joint()
            );
            self.on_configuration_committed()?;
        }
        Ok(())
    }

    fn collect_committed(&mut self) -> Result<()> {
        let first = self.log.first_index();
        if self.state.last_applied + 1 < first {
            self.state.last_applied = first - 1;
        }
        let upto = self.state.commit_index.min(self.log.last_index());
        if upto <= self.state.last_applied {
            return Ok(());
        }
        for entry in self.log.get_range(self.state.last_applied + 1, upto)? {
            self.state.last_applied = entry.index;
            self.committed.push_back(entry);
        }
        Ok(())
    }

    pub(super) fn check_ready(&mut self) {
        if self.state.ready {
            return;
        }
        if let Some(first) = self.first_commit_index {
            if self.state.commit_index >= first {
                self.state.ready = true;
                tracing::info!(
                    "Node {} is ready: commit index {} reached {}",
                    self.id,
                    self.state.commit_index,
                    first
                );
            }
        }
    }

    /// Adopts `configuration` if it is newer than the current one.
    pub(super) fn adopt_configuration(&mut self, configuration: Configuration) -> bool {
        if !configuration.is_newer_than(&self.configuration) {
            return false;
        }
        tracing::info!(
            "Node {} adopts configuration at index {} (term {}, joint: {}, force: {})",
            self.id,
            configuration.index,
            configuration.term,
            configuration.is_joint(),
            configuration.force
        );
        self.configuration = configuration;
        self.on_configuration_changed();
        true
    }

    /// Re-derives the configuration after uncommitted entries were removed.
    pub(super) fn reload_configuration(&mut self) -> Result<()> {
        let mut configuration = self.committed_configuration.clone();
        if let Some(latest) = latest_configuration_entry(self.log.as_ref(), self.log.last_index())? {
            if latest.is_newer_than(&configuration) {
                configuration = latest;
            }
        }
        if configuration != self.configuration {
            tracing::info!(
                "Node {} reverts to configuration at index {}",
                self.id,
                configuration.index
            );
            self.configuration = configuration;
            self.on_configuration_changed();
        }
        Ok(())
    }

    /// Adjusts role and leader bookkeeping to the current configuration.
    pub(super) fn on_configuration_changed(&mut self) {
        let member = self.configuration.member(&self.id).cloned();
        if member.is_some() {
            self.was_member = true;
        }
        let term = self.state.current_term;
        let leader = self.state.current_leader.clone();
        match (member, self.state.state) {
            (_, NodeState::Inactive) => {}
            (Some(m), NodeState::Passive) if m.is_active() => {
                self.state.become_follower(term, leader);
                self.reset_election_timer();
            }
            (Some(m), NodeState::Follower | NodeState::Candidate) if !m.is_active() => {
                self.state.become_passive(term, leader);
            }
            _ => {}
        }
        if self.leader.is_some() {
            self.sync_progress();
        }
    }

    fn fail_pending_requests(&mut self, reason: &str) {
        for (index, sender) in std::mem::take(&mut self.pending_commits) {
            let _ = sender.send(AppendOutcome::CommitFailed(
                index,
                RaftError::Rejected(reason.to_string()),
            ));
        }
        self.pending_writes.clear();
        if let Some(pending) = self.reconfiguration.take() {
            pending.reject(self, reason);
        }
        for (_, forwarded) in std::mem::take(&mut self.forwarded) {
            forwarded.reject(reason);
        }
        if let Some(force) = self.force.take() {
            force.reject(reason);
        }
    }
}

/// Latest configuration entry at or below `upto`.
pub(super) fn latest_configuration_entry(
    log: &dyn LogStorage,
    upto: LogIndex,
) -> Result<Option<Configuration>> {
    let first = log.first_index();
    let mut index = upto.min(log.last_index());
    while index >= first && index > 0 {
        if let Some(entry) = log.get(index)? {
            if let Some(configuration) = entry.payload.as_configuration() {
                return Ok(Some(configuration.clone()));
            }
        }
        index -= 1;
    }
    Ok(None)
}
