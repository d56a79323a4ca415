use super::configuration::Configuration;
use super::log::MemberProgress;
use super::rpc::{InstallSnapshotRequest, InstallSnapshotResponse, InstallStatus, RaftMessage};
use super::server::{latest_configuration_entry, RaftServer};
use super::types::{LogIndex, NodeId};
use crate::storage::{Snapshot, SnapshotMeta};
use crate::util::errors::{RaftError, Result};

/// Chunks received so far from the leader.
#[derive(Debug, Clone)]
pub(super) struct PendingInstall {
    pub(super) meta: SnapshotMeta,
    pub(super) chunks: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ChunkInFlight {
    pub(super) chunk_index: u32,
    pub(super) sent_at_ms: u64,
}

/// Leader side of a snapshot transfer to one member.
#[derive(Debug, Clone)]
pub(super) struct InstallProgress {
    pub(super) meta: SnapshotMeta,
    pub(super) next_chunk: u32,
    pub(super) in_flight: Option<ChunkInFlight>,
}

impl InstallProgress {
    fn new(meta: SnapshotMeta) -> Self {
        Self {
            meta,
            next_chunk: 0,
            in_flight: None,
        }
    }

    pub(super) fn timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.in_flight
            .map_or(false, |f| now_ms >= f.sent_at_ms + timeout_ms)
    }
}

impl RaftServer {
    /// Persists application state covering everything up to `index` and
    /// schedules the journal prefix it replaces for compaction.
    pub fn take_snapshot(&mut self, index: LogIndex, data: &[u8]) -> Result<SnapshotMeta> {
        let current = self.snapshot_index();
        if index <= current {
            return Err(RaftError::InvalidState(format!(
                "snapshot at {} is not newer than snapshot at {}",
                index, current
            )));
        }
        if index > self.state.commit_index {
            return Err(RaftError::InvalidState(format!(
                "cannot snapshot uncommitted index {} (commit index {})",
                index, self.state.commit_index
            )));
        }
        let term = self.term_at(index)?.ok_or_else(|| {
            RaftError::InvalidState(format!("entry {} is no longer in the journal", index))
        })?;
        let configuration = self.configuration_at(index)?;
        let snapshot = Snapshot::from_data(
            index,
            term,
            Some(configuration),
            data,
            self.config.snapshot_chunk_size,
        );
        let meta = snapshot.meta.clone();
        self.snapshots.persist(snapshot)?;
        self.pending_compaction = Some(index);
        tracing::info!(
            "Node {} took snapshot {} ({} chunks)",
            self.id,
            meta.id(),
            meta.chunk_count
        );
        Ok(meta)
    }

    /// Configuration in effect once the entry at `index` is applied.
    fn configuration_at(&self, index: LogIndex) -> Result<Configuration> {
        let mut candidates: Vec<Configuration> = Vec::new();
        if let Some(entry) = latest_configuration_entry(self.log.as_ref(), index)? {
            candidates.push(entry);
        }
        if let Some(previous) = self.snapshots.latest_meta().and_then(|m| m.configuration) {
            candidates.push(previous);
        }
        if self.committed_configuration.index <= index {
            candidates.push(self.committed_configuration.clone());
        }
        let newest = candidates
            .into_iter()
            .reduce(|a, b| if b.is_newer_than(&a) { b } else { a });
        Ok(newest.unwrap_or_else(|| self.committed_configuration.clone()))
    }

    /// A member is sent the snapshot when the entries it needs are gone, or
    /// when it lags too far behind to catch up from the journal.
    pub(super) fn should_send_snapshot(&self, progress: &MemberProgress) -> bool {
        let snapshot_index = self.snapshot_index();
        if snapshot_index == 0 || progress.snapshot_index >= snapshot_index {
            return false;
        }
        progress.next_index < self.log.first_index()
            || snapshot_index.saturating_sub(progress.next_index.saturating_sub(1))
                > self.config.replication_threshold
    }

    pub(super) fn start_install(&mut self, member: &NodeId) -> Result<()> {
        let Some(meta) = self.snapshots.latest_meta() else {
            return Err(RaftError::InvalidState(format!(
                "{} needs compacted entries but no snapshot exists",
                member
            )));
        };
        tracing::info!(
            "Node {} sending snapshot {} to {} ({} chunks)",
            self.id,
            meta.id(),
            member,
            meta.chunk_count
        );
        if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(member)) {
            progress.in_flight = None;
            progress.install = Some(InstallProgress::new(meta));
        }
        self.send_snapshot_chunk(member)
    }

    pub(super) fn send_snapshot_chunk(&mut self, member: &NodeId) -> Result<()> {
        let Some(latest) = self.snapshots.latest_meta() else {
            return Ok(());
        };
        let now = self.now_ms;
        let Some(install) = self
            .leader
            .as_mut()
            .and_then(|l| l.progress.get_mut(member))
            .and_then(|p| p.install.as_mut())
        else {
            return Ok(());
        };
        // A newer snapshot replaced the one being sent
        if install.meta.id() != latest.id() {
            *install = InstallProgress::new(latest);
        }
        let chunk_index = install.next_chunk;
        install.in_flight = Some(ChunkInFlight {
            chunk_index,
            sent_at_ms: now,
        });
        let meta = install.meta.clone();

        let data = self.snapshots.read_chunk(chunk_index).ok_or_else(|| {
            RaftError::Storage(format!("snapshot {} has no chunk {}", meta.id(), chunk_index))
        })?;
        tracing::debug!(
            "Node {} sending chunk {}/{} of snapshot {} to {}",
            self.id,
            chunk_index + 1,
            meta.chunk_count,
            meta.id(),
            member
        );
        let request = InstallSnapshotRequest {
            term: self.state.current_term,
            leader_id: self.id.clone(),
            is_last: chunk_index + 1 >= meta.chunk_count,
            meta,
            chunk_index,
            data,
        };
        self.send(member, RaftMessage::InstallSnapshot(request));
        Ok(())
    }

    pub(super) fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        response: InstallSnapshotResponse,
    ) -> Result<()> {
        if self.observe_term(response.term)? {
            return Ok(());
        }
        if !self.state.is_leader() || response.term < self.state.current_term {
            return Ok(());
        }
        let now = self.now_ms;
        let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&from)) else {
            return Ok(());
        };
        progress.last_response_ms = Some(now);
        let Some(install) = progress.install.as_mut() else {
            return Ok(());
        };
        if install.meta.id() != response.snapshot_id {
            return Ok(());
        }

        match response.status {
            InstallStatus::Ack => {
                let last_chunk = response.chunk_index + 1 >= install.meta.chunk_count;
                if response.complete || last_chunk {
                    let index = install.meta.index;
                    progress.install = None;
                    progress.snapshot_index = progress.snapshot_index.max(index);
                    progress.match_index = progress.match_index.max(index);
                    progress.next_index = index + 1;
                    tracing::info!(
                        "Node {} finished installing snapshot {} on {}",
                        self.id,
                        response.snapshot_id,
                        from
                    );
                    self.advance_commit_index()?;
                    return self.send_append(&from);
                }
                if response.chunk_index == install.next_chunk {
                    install.next_chunk += 1;
                    install.in_flight = None;
                    return self.send_snapshot_chunk(&from);
                }
                // Duplicate acknowledgement
                Ok(())
            }
            InstallStatus::Reject(reason) => {
                tracing::warn!(
                    "Node {} snapshot {} rejected by {}: {}",
                    self.id,
                    response.snapshot_id,
                    from,
                    reason
                );
                // Restarted with the next heartbeat
                install.next_chunk = 0;
                install.in_flight = None;
                Ok(())
            }
        }
    }

    pub(super) fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<()> {
        let snapshot_id = request.meta.id();
        if request.term < self.state.current_term {
            self.reply_install(
                &from,
                &snapshot_id,
                request.chunk_index,
                InstallStatus::Reject("stale term".to_string()),
                false,
            );
            return Ok(());
        }
        if request.term == self.state.current_term && self.state.is_leader() {
            return Err(RaftError::ProtocolViolation(format!(
                "{} sent a snapshot for term {}, which this member leads",
                request.leader_id, request.term
            )));
        }
        self.observe_term(request.term)?;
        if self.state.current_leader.as_ref() != Some(&request.leader_id)
            || self.state.is_candidate()
        {
            self.follow(request.term, Some(request.leader_id.clone()));
        }
        self.reset_election_timer();

        let meta = request.meta;
        if meta.index == 0 {
            self.reply_install(
                &from,
                &snapshot_id,
                request.chunk_index,
                InstallStatus::Reject("snapshot index 0".to_string()),
                false,
            );
            return Ok(());
        }
        let durable = self.state.commit_index.min(self.log.last_flushed_index());
        if meta.index <= self.snapshot_index() || meta.index <= durable {
            self.install = None;
            self.reply_install(&from, &snapshot_id, request.chunk_index, InstallStatus::Ack, true);
            return Ok(());
        }

        if self.install.as_ref().map_or(false, |p| p.meta.id() != snapshot_id) {
            tracing::debug!("Node {} abandoning partial snapshot for {}", self.id, snapshot_id);
            self.install = None;
        }
        match self.install.as_mut() {
            None if request.chunk_index != 0 => {
                let reason = format!("expected chunk 0, got {}", request.chunk_index);
                self.reply_install(
                    &from,
                    &snapshot_id,
                    request.chunk_index,
                    InstallStatus::Reject(reason),
                    false,
                );
                return Ok(());
            }
            None => {
                tracing::info!(
                    "Node {} receiving snapshot {} from {}",
                    self.id,
                    snapshot_id,
                    request.leader_id
                );
                self.install = Some(PendingInstall {
                    meta: meta.clone(),
                    chunks: vec![request.data],
                });
            }
            Some(pending) => {
                let expected = pending.chunks.len() as u32;
                if request.chunk_index + 1 == expected {
                    self.reply_install(
                        &from,
                        &snapshot_id,
                        request.chunk_index,
                        InstallStatus::Ack,
                        false,
                    );
                    return Ok(());
                }
                if request.chunk_index != expected {
                    self.install = None;
                    let reason = format!("expected chunk {}, got {}", expected, request.chunk_index);
                    self.reply_install(
                        &from,
                        &snapshot_id,
                        request.chunk_index,
                        InstallStatus::Reject(reason),
                        false,
                    );
                    return Ok(());
                }
                pending.chunks.push(request.data);
            }
        }

        let received = self.install.as_ref().map_or(0, |p| p.chunks.len() as u32);
        if received < meta.chunk_count {
            self.reply_install(&from, &snapshot_id, request.chunk_index, InstallStatus::Ack, false);
            return Ok(());
        }

        let Some(pending) = self.install.take() else {
            return Ok(());
        };
        let snapshot = Snapshot {
            meta: pending.meta,
            chunks: pending.chunks,
        };
        if !snapshot.verify() {
            self.reply_install(
                &from,
                &snapshot_id,
                request.chunk_index,
                InstallStatus::Reject("checksum mismatch".to_string()),
                false,
            );
            return Ok(());
        }
        if let Err(e) = self.snapshots.persist(snapshot) {
            tracing::warn!("Node {} failed to persist snapshot {}: {}", self.id, snapshot_id, e);
            self.reply_install(
                &from,
                &snapshot_id,
                request.chunk_index,
                InstallStatus::Reject(e.to_string()),
                false,
            );
            return Ok(());
        }
        self.apply_installed_snapshot(&meta)?;
        self.reply_install(&from, &snapshot_id, request.chunk_index, InstallStatus::Ack, true);
        Ok(())
    }

    /// Replaces the journal with a persisted snapshot.
    fn apply_installed_snapshot(&mut self, meta: &SnapshotMeta) -> Result<()> {
        self.log.reset(meta.index + 1)?;
        if let Some(configuration) = meta.configuration.clone() {
            if configuration.is_newer_than(&self.committed_configuration) {
                self.committed_configuration = configuration.clone();
                self.meta.save_configuration(&configuration)?;
            }
            self.adopt_configuration(configuration);
        }
        self.state.last_applied = self.state.last_applied.max(meta.index);
        if meta.index > self.state.commit_index {
            self.state.commit_index = meta.index;
            self.meta.save_commit_index(meta.index)?;
        }
        self.check_ready();
        tracing::info!(
            "Node {} installed snapshot {} at index {} (term {})",
            self.id,
            meta.id(),
            meta.index,
            meta.term
        );
        Ok(())
    }

    fn reply_install(
        &mut self,
        to: &NodeId,
        snapshot_id: &str,
        chunk_index: u32,
        status: InstallStatus,
        complete: bool,
    ) {
        let response = InstallSnapshotResponse {
            term: self.state.current_term,
            snapshot_id: snapshot_id.to_string(),
            chunk_index,
            status,
            complete,
        };
        self.send(to, RaftMessage::InstallSnapshotResponse(response));
    }
}
