use futures::channel::oneshot;
use std::collections::BTreeSet;

use super::configuration::{Configuration, Member};
use super::rpc::{
    ConfigureRequest, ConfigureResponse, ForceConfigureRequest, ForceConfigureResponse,
    JoinRequest, LeaveRequest, RaftMessage, ReconfigureResponse,
};
use super::server::RaftServer;
use super::state::NodeState;
use super::types::{EntryPayload, LogEntry, NodeId, Term};
use crate::util::errors::{RaftError, Result};

pub type ReconfigureResult = std::result::Result<Configuration, RaftError>;

/// Completion of a join, leave or force-configure request.
pub struct ReconfigureHandle {
    pub receiver: oneshot::Receiver<ReconfigureResult>,
}

impl ReconfigureHandle {
    fn ready(result: ReconfigureResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    /// The result, if it is already decided.
    pub fn try_result(&mut self) -> Option<ReconfigureResult> {
        self.receiver.try_recv().ok().flatten()
    }

    pub async fn wait(self) -> ReconfigureResult {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(RaftError::Rejected("member stopped".to_string())))
    }
}

/// Membership change requested by a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum MembershipChange {
    Join(Member),
    Leave(NodeId),
}

/// Where the result of a membership change goes.
pub(super) enum Responder {
    Local(oneshot::Sender<ReconfigureResult>),
    Remote { origin: NodeId, request_id: u64 },
}

impl Responder {
    fn respond(self, server: &mut RaftServer, result: ReconfigureResult) {
        match self {
            Responder::Local(sender) => {
                let _ = sender.send(result);
            }
            Responder::Remote { origin, request_id } => {
                let response = ReconfigureResponse {
                    request_id,
                    result: result.map_err(|e| e.to_string()),
                };
                server.send(&origin, RaftMessage::ReconfigureResponse(response));
            }
        }
    }

    fn is_remote(&self, origin: &str, id: u64) -> bool {
        matches!(self, Responder::Remote { origin: o, request_id } if o == origin && *request_id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// Waiting for the joint configuration to commit
    Joint,
    /// Waiting for the final configuration to commit
    Final,
}

/// Membership change driven by this leader.
pub(super) struct PendingReconfiguration {
    /// Empty once every requester gave up; the change still completes
    responders: Vec<Responder>,
    removed: Vec<NodeId>,
    phase: Phase,
    deadline_ms: u64,
}

impl PendingReconfiguration {
    pub(super) fn reject(self, server: &mut RaftServer, reason: &str) {
        for responder in self.responders {
            responder.respond(server, Err(RaftError::Rejected(reason.to_string())));
        }
    }
}

/// Join or leave sent on to another member.
pub(super) struct ForwardedRequest {
    change: MembershipChange,
    sender: oneshot::Sender<ReconfigureResult>,
    deadline_ms: u64,
    next_attempt_ms: u64,
    attempts: usize,
}

impl ForwardedRequest {
    pub(super) fn reject(self, reason: &str) {
        let _ = self
            .sender
            .send(Err(RaftError::Rejected(reason.to_string())));
    }
}

/// Forced configuration being pushed by this member.
pub(super) struct PendingForceConfigure {
    request_id: u64,
    configuration: Configuration,
    unacked: BTreeSet<NodeId>,
    /// The original request and any retries of the same target
    senders: Vec<oneshot::Sender<ReconfigureResult>>,
    deadline_ms: u64,
    next_resend_ms: u64,
}

impl PendingForceConfigure {
    pub(super) fn reject(self, reason: &str) {
        for sender in self.senders {
            let _ = sender.send(Err(RaftError::Rejected(reason.to_string())));
        }
    }

    fn complete(self) {
        for sender in self.senders {
            let _ = sender.send(Ok(self.configuration.clone()));
        }
    }
}

impl RaftServer {
    /// Adds `member` to the cluster through joint consensus.
    pub fn join(&mut self, member: Member) -> ReconfigureHandle {
        let (sender, receiver) = oneshot::channel();
        let change = MembershipChange::Join(member);
        if self.state.is_leader() {
            if let Err(e) = self.leader_reconfigure(change, Responder::Local(sender)) {
                self.on_error(e);
            }
        } else {
            self.forward(change, sender);
        }
        ReconfigureHandle { receiver }
    }

    /// Removes `member_id` from the cluster. Removing a member that is not
    /// part of the configuration succeeds immediately.
    pub fn leave(&mut self, member_id: NodeId) -> ReconfigureHandle {
        if !self.configuration.contains(&member_id) {
            return ReconfigureHandle::ready(Ok(self.configuration.clone()));
        }
        let (sender, receiver) = oneshot::channel();
        let change = MembershipChange::Leave(member_id);
        if self.state.is_leader() {
            if let Err(e) = self.leader_reconfigure(change, Responder::Local(sender)) {
                self.on_error(e);
            }
        } else {
            self.forward(change, sender);
        }
        ReconfigureHandle { receiver }
    }

    fn leader_reconfigure(&mut self, change: MembershipChange, responder: Responder) -> Result<()> {
        let Some(initial_index) = self.leader.as_ref().map(|l| l.initial_index) else {
            let leader = self.state.current_leader.clone();
            responder.respond(self, Err(RaftError::NotLeader { leader }));
            return Ok(());
        };
        if let (Some(pending), Responder::Remote { origin, request_id }) =
            (&self.reconfiguration, &responder)
        {
            if pending
                .responders
                .iter()
                .any(|r| r.is_remote(origin, *request_id))
            {
                // Retry of the change already in progress
                return Ok(());
            }
        }
        if self.reconfiguration.is_some() && self.pending_target_includes(&change) {
            tracing::debug!("Node {} {:?} already in progress", self.id, change);
            if let Some(pending) = self.reconfiguration.as_mut() {
                pending.responders.push(responder);
            }
            return Ok(());
        }

        let current = self.configuration.members.clone();
        let target: Vec<Member> = match &change {
            MembershipChange::Join(member) => {
                let mut target: Vec<Member> =
                    current.iter().filter(|m| m.id != member.id).cloned().collect();
                target.push(member.clone().joined_at(self.now_ms));
                target
            }
            MembershipChange::Leave(id) => current.iter().filter(|m| &m.id != id).cloned().collect(),
        };
        if self.configuration.same_members(&target) && self.configuration == self.committed_configuration {
            responder.respond(self, Ok(self.configuration.clone()));
            return Ok(());
        }

        let rejection = if self.state.commit_index < initial_index {
            Some("leader has not committed its initial entry".to_string())
        } else if self.reconfiguration.is_some() {
            Some("another configuration change is in progress".to_string())
        } else if self.configuration != self.committed_configuration || self.configuration.is_joint() {
            Some("current configuration is not committed".to_string())
        } else if !target.iter().any(|m| m.is_active()) {
            Some("configuration would have no active member".to_string())
        } else if let MembershipChange::Leave(id) = &change {
            self.check_leave_quorum(id, &target)
        } else {
            None
        };
        if let Some(reason) = rejection {
            tracing::warn!("Node {} rejected {:?}: {}", self.id, change, reason);
            responder.respond(self, Err(RaftError::Rejected(reason)));
            return Ok(());
        }

        let removed: Vec<NodeId> = current
            .iter()
            .filter(|m| !target.iter().any(|t| t.id == m.id))
            .map(|m| m.id.clone())
            .collect();
        let joint = Configuration::joint(
            self.log.last_index() + 1,
            self.state.current_term,
            self.now_ms,
            current,
            target,
        );
        tracing::info!(
            "Node {} starting {:?} with joint configuration at index {}",
            self.id,
            change,
            joint.index
        );
        self.reconfiguration = Some(PendingReconfiguration {
            responders: vec![responder],
            removed,
            phase: Phase::Joint,
            deadline_ms: self.now_ms + self.config.reconfigure_timeout_ms,
        });
        if let Err(e) = self.append_configuration(joint) {
            if let Some(pending) = self.reconfiguration.take() {
                pending.reject(self, &e.to_string());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Whether the configuration being committed already carries `change`.
    fn pending_target_includes(&self, change: &MembershipChange) -> bool {
        let target = &self.configuration.members;
        match change {
            MembershipChange::Join(member) => target
                .iter()
                .any(|m| m.id == member.id && m.member_type == member.member_type),
            MembershipChange::Leave(id) => !target.iter().any(|m| &m.id == id),
        }
    }

    /// Removing a member must leave enough reachable voters to form the new quorum.
    fn check_leave_quorum(&self, leaving: &NodeId, target: &[Member]) -> Option<String> {
        let leader = self.leader.as_ref()?;
        let now = self.now_ms;
        let timeout = self.config.quorum_timeout_ms;
        let needed = Configuration::new(0, 0, 0, target.to_vec()).quorum_size();
        let reachable = target
            .iter()
            .filter(|m| m.is_active())
            .filter(|m| {
                m.id == self.id
                    || leader
                        .progress
                        .get(&m.id)
                        .and_then(|p| p.last_response_ms)
                        .map_or(false, |t| now <= t + timeout)
            })
            .count();
        if reachable < needed {
            Some(format!(
                "removing {} leaves {} reachable voters, {} needed",
                leaving, reachable, needed
            ))
        } else {
            None
        }
    }

    /// Appends a configuration entry and starts replicating it right away.
    fn append_configuration(&mut self, configuration: Configuration) -> Result<()> {
        let entry = LogEntry::new(
            self.state.current_term,
            configuration.index,
            EntryPayload::Configuration(configuration.clone()),
        );
        self.log.append(vec![entry])?;
        self.adopt_configuration(configuration);
        self.flush_log();
        self.replicate_all()?;
        self.advance_commit_index()
    }

    /// Reacts to `committed_configuration` having just committed.
    pub(super) fn on_configuration_committed(&mut self) -> Result<()> {
        let committed = self.committed_configuration.clone();

        if !committed.contains(&self.id) {
            if self.was_member && !self.state.is_inactive() {
                if self.state.is_leader() {
                    self.finish_reconfiguration(&committed);
                }
                tracing::info!(
                    "Node {} left the cluster with configuration at index {}",
                    self.id,
                    committed.index
                );
                self.abandon_leadership("removed from the cluster");
                self.state.become_inactive();
            }
            return Ok(());
        }
        if !self.state.is_leader() {
            return Ok(());
        }
        if committed.is_joint() {
            return self.append_final_configuration();
        }
        self.finish_reconfiguration(&committed);
        Ok(())
    }

    /// Leaves the joint (or forced) configuration for a normal one with the
    /// same target members.
    fn append_final_configuration(&mut self) -> Result<()> {
        let current = self.configuration.clone();
        let final_configuration = Configuration::new(
            self.log.last_index() + 1,
            self.state.current_term,
            self.now_ms,
            current.members.clone(),
        );
        let removed: Vec<NodeId> = current
            .old_members
            .iter()
            .filter(|m| !current.members.iter().any(|t| t.id == m.id))
            .map(|m| m.id.clone())
            .collect();
        match self.reconfiguration.as_mut() {
            Some(pending) => pending.phase = Phase::Final,
            None => {
                self.reconfiguration = Some(PendingReconfiguration {
                    responders: Vec::new(),
                    removed,
                    phase: Phase::Final,
                    deadline_ms: self.now_ms + self.config.reconfigure_timeout_ms,
                })
            }
        }
        tracing::info!(
            "Node {} appending final configuration at index {}",
            self.id,
            final_configuration.index
        );
        self.append_configuration(final_configuration)
    }

    fn finish_reconfiguration(&mut self, committed: &Configuration) {
        let Some(pending) = self.reconfiguration.take() else {
            return;
        };
        if pending.phase != Phase::Final {
            self.reconfiguration = Some(pending);
            return;
        }
        let request = ConfigureRequest {
            term: self.state.current_term,
            leader_id: self.id.clone(),
            configuration: committed.clone(),
            joint: false,
        };
        for member in &pending.removed {
            if member != &self.id {
                self.send(member, RaftMessage::Configure(request.clone()));
            }
        }
        tracing::info!(
            "Node {} completed reconfiguration at index {}",
            self.id,
            committed.index
        );
        for responder in pending.responders {
            responder.respond(self, Ok(committed.clone()));
        }
    }

    fn forward(&mut self, change: MembershipChange, sender: oneshot::Sender<ReconfigureResult>) {
        let request_id = self.next_request_id();
        self.forwarded.insert(
            request_id,
            ForwardedRequest {
                change,
                sender,
                deadline_ms: self.now_ms + self.config.reconfigure_timeout_ms,
                next_attempt_ms: self.now_ms,
                attempts: 0,
            },
        );
        self.send_forwarded(request_id);
    }

    /// Sends a forwarded request to the known leader, or to the next contact.
    fn send_forwarded(&mut self, request_id: u64) {
        let contacts: Vec<NodeId> = self.configuration.replication_targets(&self.id);
        let leader = self
            .state
            .current_leader
            .clone()
            .filter(|l| l != &self.id);
        let retry = self.config.request_timeout_ms * 2;
        let now = self.now_ms;
        let origin = self.id.clone();
        let Some(forwarded) = self.forwarded.get_mut(&request_id) else {
            return;
        };
        let target = leader.or_else(|| {
            (!contacts.is_empty()).then(|| contacts[forwarded.attempts % contacts.len()].clone())
        });
        forwarded.attempts += 1;
        forwarded.next_attempt_ms = now + retry;
        let Some(target) = target else {
            return;
        };
        let message = match &forwarded.change {
            MembershipChange::Join(member) => RaftMessage::Join(JoinRequest {
                origin,
                request_id,
                member: member.clone(),
            }),
            MembershipChange::Leave(member_id) => RaftMessage::Leave(LeaveRequest {
                origin,
                request_id,
                member_id: member_id.clone(),
            }),
        };
        self.send(&target, message);
    }

    pub(super) fn handle_join(&mut self, request: JoinRequest) -> Result<()> {
        if self.state.is_leader() {
            let responder = Responder::Remote {
                origin: request.origin,
                request_id: request.request_id,
            };
            return self.leader_reconfigure(MembershipChange::Join(request.member), responder);
        }
        if let Some(leader) = self.state.current_leader.clone() {
            self.send(&leader, RaftMessage::Join(request));
        }
        Ok(())
    }

    pub(super) fn handle_leave(&mut self, request: LeaveRequest) -> Result<()> {
        if !self.configuration.contains(&request.member_id) {
            let response = ReconfigureResponse {
                request_id: request.request_id,
                result: Ok(self.configuration.clone()),
            };
            self.send(&request.origin, RaftMessage::ReconfigureResponse(response));
            return Ok(());
        }
        if self.state.is_leader() {
            let responder = Responder::Remote {
                origin: request.origin,
                request_id: request.request_id,
            };
            return self.leader_reconfigure(MembershipChange::Leave(request.member_id), responder);
        }
        if let Some(leader) = self.state.current_leader.clone() {
            self.send(&leader, RaftMessage::Leave(request));
        }
        Ok(())
    }

    pub(super) fn handle_reconfigure_response(&mut self, response: ReconfigureResponse) -> Result<()> {
        if let Some(forwarded) = self.forwarded.remove(&response.request_id) {
            tracing::info!(
                "Node {} got answer to {:?}: {}",
                self.id,
                forwarded.change,
                if response.result.is_ok() { "accepted" } else { "rejected" }
            );
            let _ = forwarded
                .sender
                .send(response.result.map_err(RaftError::Rejected));
        }
        Ok(())
    }

    /// Adopts a committed configuration pushed by the leader.
    pub(super) fn handle_configure(&mut self, from: NodeId, request: ConfigureRequest) -> Result<()> {
        if request.term < self.state.current_term {
            self.reply_configure(&from, false);
            return Ok(());
        }
        self.observe_term(request.term)?;
        let configuration = request.configuration;
        if configuration.is_newer_than(&self.committed_configuration) {
            self.committed_configuration = configuration.clone();
            self.meta.save_configuration(&configuration)?;
            self.adopt_configuration(configuration);
        }
        if !self.committed_configuration.contains(&self.id) && self.was_member {
            tracing::info!(
                "Node {} removed from the cluster by {}",
                self.id,
                request.leader_id
            );
            self.abandon_leadership("removed from the cluster");
            self.state.become_inactive();
        }
        self.reply_configure(&from, true);
        Ok(())
    }

    fn reply_configure(&mut self, to: &NodeId, accepted: bool) {
        let response = ConfigureResponse {
            term: self.state.current_term,
            accepted,
            configuration_index: self.committed_configuration.index,
        };
        self.send(to, RaftMessage::ConfigureResponse(response));
    }

    pub(super) fn handle_configure_response(
        &mut self,
        from: NodeId,
        response: ConfigureResponse,
    ) -> Result<()> {
        tracing::debug!(
            "Node {} configuration push to {} accepted: {} (index {})",
            self.id,
            from,
            response.accepted,
            response.configuration_index
        );
        self.observe_term(response.term)?;
        Ok(())
    }

    /// Installs `members` on every listed member without quorum agreement.
    ///
    /// Used to recover a cluster that lost a majority of its members. The
    /// caller must be among `members`. Forcing the members already
    /// configured is a no-op that keeps the term. A retry while the same
    /// target is still being pushed completes together with the first request.
    pub fn force_configure(&mut self, members: Vec<Member>) -> ReconfigureHandle {
        if !members.iter().any(|m| m.id == self.id) {
            return ReconfigureHandle::ready(Err(RaftError::InvalidConfig(format!(
                "{} must be part of the forced configuration",
                self.id
            ))));
        }
        if let Some(force) = self.force.as_mut() {
            if !force.configuration.same_members(&members) {
                return ReconfigureHandle::ready(Err(RaftError::Rejected(
                    "another forced configuration is in progress".to_string(),
                )));
            }
            let (sender, receiver) = oneshot::channel();
            force.senders.push(sender);
            return ReconfigureHandle { receiver };
        }
        if self.configuration.same_members(&members) {
            return ReconfigureHandle::ready(Ok(self.configuration.clone()));
        }

        let term = self.state.current_term + 1;
        if let Err(e) = self.observe_term(term) {
            return ReconfigureHandle::ready(Err(e));
        }
        let index = self.configuration.index.max(self.log.last_index()) + 1;
        let configuration = Configuration::forced(index, term, self.now_ms, members);
        if let Err(e) = self.apply_forced_configuration(configuration.clone()) {
            return ReconfigureHandle::ready(Err(e));
        }
        tracing::warn!(
            "Node {} forced configuration {:?} in term {}",
            self.id,
            configuration.members.iter().map(|m| &m.id).collect::<Vec<_>>(),
            term
        );

        let unacked: BTreeSet<NodeId> = configuration
            .members
            .iter()
            .filter(|m| m.id != self.id)
            .map(|m| m.id.clone())
            .collect();
        let (sender, receiver) = oneshot::channel();
        if unacked.is_empty() {
            let _ = sender.send(Ok(configuration));
            return ReconfigureHandle { receiver };
        }
        let request_id = self.next_request_id();
        self.force = Some(PendingForceConfigure {
            request_id,
            configuration,
            unacked,
            senders: vec![sender],
            deadline_ms: self.now_ms + self.config.reconfigure_timeout_ms,
            next_resend_ms: self.now_ms,
        });
        self.send_force_configure();
        ReconfigureHandle { receiver }
    }

    fn send_force_configure(&mut self) {
        let now = self.now_ms;
        let term = self.state.current_term;
        let resend = self.config.request_timeout_ms;
        let Some(force) = self.force.as_mut() else {
            return;
        };
        force.next_resend_ms = now + resend;
        let request = ForceConfigureRequest {
            term,
            index: force.configuration.index,
            members: force.configuration.members.clone(),
            request_id: force.request_id,
        };
        let targets: Vec<NodeId> = force.unacked.iter().cloned().collect();
        for target in targets {
            self.send(&target, RaftMessage::ForceConfigure(request.clone()));
        }
    }

    fn apply_forced_configuration(&mut self, configuration: Configuration) -> Result<()> {
        if self.state.is_leader() {
            let term = self.state.current_term;
            self.abandon_leadership("forced configuration");
            self.follow(term, None);
        }
        self.committed_configuration = configuration.clone();
        self.meta.save_configuration(&configuration)?;
        self.configuration = configuration;
        self.on_configuration_changed();
        self.reset_election_timer();
        Ok(())
    }

    pub(super) fn handle_force_configure(
        &mut self,
        from: NodeId,
        request: ForceConfigureRequest,
    ) -> Result<()> {
        if request.term < self.state.current_term {
            self.reply_force(&from, request.request_id, Err("stale term".to_string()));
            return Ok(());
        }
        self.observe_term(request.term)?;

        if self.configuration.same_members(&request.members) {
            self.reply_force(&from, request.request_id, Ok(()));
            return Ok(());
        }
        if self.configuration.force {
            let reason = format!(
                "already forced to a different configuration at index {}",
                self.configuration.index
            );
            self.reply_force(&from, request.request_id, Err(reason));
            return Ok(());
        }

        let index = request.index.max(self.configuration.index + 1);
        let term: Term = self.state.current_term;
        let configuration = Configuration::forced(index, term, self.now_ms, request.members);
        tracing::warn!(
            "Node {} adopting configuration forced by {} at index {}",
            self.id,
            from,
            index
        );
        self.apply_forced_configuration(configuration)?;
        self.reply_force(&from, request.request_id, Ok(()));
        Ok(())
    }

    fn reply_force(&mut self, to: &NodeId, request_id: u64, result: std::result::Result<(), String>) {
        let response = ForceConfigureResponse {
            term: self.state.current_term,
            accepted: result.is_ok(),
            request_id,
            reason: result.err(),
        };
        self.send(to, RaftMessage::ForceConfigureResponse(response));
    }

    pub(super) fn handle_force_configure_response(
        &mut self,
        from: NodeId,
        response: ForceConfigureResponse,
    ) -> Result<()> {
        if !self.state.is_inactive() {
            self.observe_term(response.term)?;
        }
        let Some(force) = self.force.as_mut() else {
            return Ok(());
        };
        if force.request_id != response.request_id {
            return Ok(());
        }
        if !response.accepted {
            let reason = response
                .reason
                .unwrap_or_else(|| "forced configuration refused".to_string());
            tracing::warn!("Node {} forced configuration refused by {}: {}", self.id, from, reason);
            if let Some(force) = self.force.take() {
                force.reject(&format!("{} refused: {}", from, reason));
            }
            return Ok(());
        }
        force.unacked.remove(&from);
        if force.unacked.is_empty() {
            if let Some(force) = self.force.take() {
                tracing::info!(
                    "Node {} forced configuration acknowledged by all members",
                    self.id
                );
                force.complete();
            }
        }
        Ok(())
    }

    /// Deadlines and retries of membership requests.
    pub(super) fn reconfigure_tick(&mut self) -> Result<()> {
        let now = self.now_ms;

        if self.state.is_leader() {
            let expired = self
                .reconfiguration
                .as_ref()
                .map_or(false, |p| !p.responders.is_empty() && now >= p.deadline_ms);
            if expired {
                let responders = self
                    .reconfiguration
                    .as_mut()
                    .map(|p| std::mem::take(&mut p.responders))
                    .unwrap_or_default();
                tracing::warn!("Node {} reconfiguration timed out", self.id);
                for responder in responders {
                    responder.respond(self, Err(RaftError::Rejected("reconfiguration timed out".to_string())));
                }
            }
            let initial_committed = self
                .leader
                .as_ref()
                .map_or(false, |l| self.state.commit_index >= l.initial_index);
            let unfinished = self.committed_configuration == self.configuration
                && (self.configuration.is_joint() || self.configuration.force);
            if initial_committed && unfinished && self.reconfiguration.is_none() {
                self.append_final_configuration()?;
            }
        }

        let expired: Vec<u64> = self
            .forwarded
            .iter()
            .filter(|(_, f)| now >= f.deadline_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(forwarded) = self.forwarded.remove(&id) {
                tracing::warn!("Node {} {:?} timed out", self.id, forwarded.change);
                forwarded.reject("reconfiguration timed out");
            }
        }
        let retries: Vec<u64> = self
            .forwarded
            .iter()
            .filter(|(_, f)| now >= f.next_attempt_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in retries {
            self.send_forwarded(id);
        }

        if let Some(force) = &self.force {
            if now >= force.deadline_ms {
                if let Some(force) = self.force.take() {
                    tracing::warn!(
                        "Node {} forced configuration not acknowledged by {:?}",
                        self.id,
                        force.unacked
                    );
                    force.reject("forced configuration timed out");
                }
            } else if now >= force.next_resend_ms {
                self.send_force_configure();
            }
        }
        Ok(())
    }

    /// Whether this member was removed from (or never admitted to) the cluster.
    pub fn has_left(&self) -> bool {
        self.state.state == NodeState::Inactive && self.was_member && !self.configuration.contains(&self.id)
    }
}
