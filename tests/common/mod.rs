#![allow(dead_code)]

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use raftline::audit::ClusterAuditor;
use raftline::config::RaftConfig;
use raftline::raft::{
    AppendHandle, ApplicationEntry, Envelope, LogEntry, Member, NodeId, RaftMessage, RaftServer,
    StartMode,
};
use raftline::storage::{
    FaultyFlush, FaultyPersistHook, MemoryLogStorage, MemorySnapshotStore, MemoryStateStorage,
    RaftStorage,
};

/// Message rounds delivered per tick before the rest waits for the next one.
const MAX_ROUNDS: usize = 16;

/// Storage that outlives a member's crash, with fault switches.
pub struct Disk {
    pub log: MemoryLogStorage,
    pub state: MemoryStateStorage,
    pub snapshots: MemorySnapshotStore,
    pub flush: FaultyFlush,
    pub hook: FaultyPersistHook,
}

impl Disk {
    pub fn new() -> Self {
        let flush = FaultyFlush::new();
        let hook = FaultyPersistHook::new();
        Self {
            log: MemoryLogStorage::with_flusher(Box::new(flush.clone())),
            state: MemoryStateStorage::new(),
            snapshots: MemorySnapshotStore::with_hook(Box::new(hook.clone())),
            flush,
            hook,
        }
    }

    pub fn storage(&self) -> RaftStorage {
        RaftStorage {
            log: Box::new(self.log.clone()),
            state: Box::new(self.state.clone()),
            snapshots: Box::new(self.snapshots.clone()),
        }
    }
}

pub struct SimNode {
    pub disk: Disk,
    pub server: Option<RaftServer>,
    /// Everything the member handed to the application, across restarts
    pub applied: Vec<LogEntry>,
    pub members: Vec<Member>,
    pub seed: u64,
}

pub fn config(id: &str, seed: u64) -> RaftConfig {
    RaftConfig {
        node_id: id.to_string(),
        seed: Some(seed),
        snapshot_chunk_size: 16,
        ..RaftConfig::default()
    }
}

/// A cluster of in-memory members driven by logical ticks over a simulated
/// network that can lose, duplicate, reorder and partition messages.
pub struct Cluster {
    pub nodes: BTreeMap<NodeId, SimNode>,
    pub auditor: ClusterAuditor,
    pending: Vec<Envelope>,
    rng: StdRng,
    drop_rate: f64,
    duplicate_rate: f64,
    reorder: bool,
    groups: BTreeMap<NodeId, usize>,
    /// Message kind -> (messages let through first, messages then dropped)
    blocked: BTreeMap<&'static str, (u32, u32)>,
    sent: BTreeMap<&'static str, u64>,
    next_position: u64,
    next_seed: u64,
}

impl Cluster {
    pub fn new(ids: &[&str], seed: u64) -> Self {
        let members = ids.iter().map(|id| Member::active(*id)).collect();
        Self::with_members(members, seed)
    }

    pub fn with_members(members: Vec<Member>, seed: u64) -> Self {
        let mut cluster = Self {
            nodes: BTreeMap::new(),
            auditor: ClusterAuditor::new(),
            pending: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder: false,
            groups: BTreeMap::new(),
            blocked: BTreeMap::new(),
            sent: BTreeMap::new(),
            next_position: 1,
            next_seed: seed * 100,
        };
        for member in &members {
            cluster.add_node(&member.id, members.clone(), StartMode::Bootstrap);
        }
        cluster
    }

    /// Starts a member with empty storage that knows `members`.
    pub fn add_node(&mut self, id: &str, members: Vec<Member>, mode: StartMode) {
        self.next_seed += 1;
        let node = SimNode {
            disk: Disk::new(),
            server: None,
            applied: Vec::new(),
            members,
            seed: self.next_seed,
        };
        self.nodes.insert(id.to_string(), node);
        self.restart(id, mode);
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn running(&self) -> impl Iterator<Item = &RaftServer> {
        self.nodes.values().filter_map(|n| n.server.as_ref())
    }

    pub fn server(&self, id: &str) -> &RaftServer {
        self.nodes[id]
            .server
            .as_ref()
            .unwrap_or_else(|| panic!("{} is not running", id))
    }

    pub fn server_mut(&mut self, id: &str) -> &mut RaftServer {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.server.as_mut())
            .unwrap_or_else(|| panic!("{} is not running", id))
    }

    pub fn node(&self, id: &str) -> &SimNode {
        &self.nodes[id]
    }

    pub fn applied(&self, id: &str) -> &[LogEntry] {
        &self.nodes[id].applied
    }

    /// Stops a member abruptly; unflushed journal entries are lost.
    pub fn crash(&mut self, id: &str) {
        let node = self.nodes.get_mut(id).expect("unknown member");
        node.server = None;
        node.disk.log.crash();
    }

    /// Replaces a stopped member's storage with empty storage.
    pub fn wipe(&mut self, id: &str) {
        let node = self.nodes.get_mut(id).expect("unknown member");
        assert!(node.server.is_none(), "{} must be crashed before it is wiped", id);
        node.disk = Disk::new();
    }

    pub fn restart(&mut self, id: &str, mode: StartMode) {
        let node = self.nodes.get_mut(id).expect("unknown member");
        let mut server = RaftServer::new(
            config(id, node.seed),
            node.disk.storage(),
            node.members.clone(),
            mode,
        )
        .expect("member failed to open its storage");
        server.start();
        node.server = Some(server);
    }

    pub fn partition(&mut self, groups: &[&[&str]]) {
        self.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for member in members.iter() {
                self.groups.insert(member.to_string(), group);
            }
        }
    }

    pub fn heal(&mut self) {
        self.groups.clear();
    }

    pub fn set_drop_rate(&mut self, rate: f64) {
        self.drop_rate = rate;
    }

    pub fn set_duplicate_rate(&mut self, rate: f64) {
        self.duplicate_rate = rate;
    }

    pub fn set_reorder(&mut self, reorder: bool) {
        self.reorder = reorder;
    }

    /// Lets `skip` messages of the given kind through, then drops `count`.
    pub fn drop_after(&mut self, kind: &'static str, skip: u32, count: u32) {
        self.blocked.insert(kind, (skip, count));
    }

    /// Messages of the given kind put on the network since the last reset,
    /// dropped ones included.
    pub fn sent(&self, kind: &str) -> u64 {
        self.sent.get(kind).copied().unwrap_or(0)
    }

    pub fn reset_sent(&mut self) {
        self.sent.clear();
    }

    /// Delivers `message` to `to` directly and returns what it answered.
    pub fn handle_direct(&mut self, to: &str, from: &str, message: RaftMessage) -> Vec<Envelope> {
        self.collect();
        let server = self.server_mut(to);
        server.handle(from.to_string(), message);
        server.take_outbox()
    }

    /// Appends the next application entry on `id`.
    pub fn append(&mut self, id: &str) -> AppendHandle {
        let position = self.next_position;
        self.next_position += 1;
        let entry = ApplicationEntry::new(position, position, position.to_be_bytes().to_vec());
        self.server_mut(id).append(entry)
    }

    pub fn step(&mut self) {
        for node in self.nodes.values_mut() {
            if let Some(server) = node.server.as_mut() {
                server.tick();
            }
        }
        self.deliver();
        self.audit();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `done` holds; false if it never did within `max_ticks`.
    pub fn run_until(&mut self, max_ticks: usize, mut done: impl FnMut(&Cluster) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// The running leader of the highest term.
    pub fn leader(&self) -> Option<NodeId> {
        self.running()
            .filter(|s| s.is_leader())
            .max_by_key(|s| s.term())
            .map(|s| s.id().clone())
    }

    /// Waits for a leader whose initial entry committed.
    pub fn await_leader(&mut self, max_ticks: usize) -> NodeId {
        let found = self.run_until(max_ticks, |c| {
            c.running().any(|s| s.is_leader() && s.is_ready())
        });
        assert!(found, "no leader within {} ticks", max_ticks);
        self.leader().expect("leader disappeared")
    }

    /// Every running member committed everything the leader has.
    pub fn converged(&self) -> bool {
        let Some(leader) = self.leader() else {
            return false;
        };
        let leader = self.server(&leader);
        let last = leader.log().last_index();
        leader.is_ready()
            && leader.commit_index() == last
            && self
                .running()
                .filter(|s| !s.has_left())
                .all(|s| s.commit_index() == last)
    }

    fn collect(&mut self) {
        for node in self.nodes.values_mut() {
            if let Some(server) = node.server.as_mut() {
                self.pending.extend(server.take_outbox());
            }
        }
    }

    fn admit(&mut self, envelope: &Envelope) -> bool {
        if !self.groups.is_empty() {
            let from = self.groups.get(&envelope.from);
            let to = self.groups.get(&envelope.to);
            if from.is_none() || from != to {
                return false;
            }
        }
        if let Some((skip, remaining)) = self.blocked.get_mut(envelope.message.kind()) {
            if *skip > 0 {
                *skip -= 1;
            } else if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
        }
        !(self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate))
    }

    fn deliver(&mut self) {
        for _ in 0..MAX_ROUNDS {
            self.collect();
            if self.pending.is_empty() {
                return;
            }
            let mut batch = std::mem::take(&mut self.pending);
            if self.reorder {
                batch.shuffle(&mut self.rng);
            }
            for envelope in batch {
                *self.sent.entry(envelope.message.kind()).or_insert(0) += 1;
                if !self.admit(&envelope) {
                    continue;
                }
                let copies = if self.duplicate_rate > 0.0 && self.rng.gen_bool(self.duplicate_rate) {
                    2
                } else {
                    1
                };
                let Some(server) = self
                    .nodes
                    .get_mut(&envelope.to)
                    .and_then(|n| n.server.as_mut())
                else {
                    continue;
                };
                for _ in 0..copies {
                    server.handle(envelope.from.clone(), envelope.message.clone());
                }
            }
        }
        self.collect();
    }

    fn audit(&mut self) {
        for node in self.nodes.values_mut() {
            let Some(server) = node.server.as_mut() else {
                continue;
            };
            let entries = self
                .auditor
                .observe(server)
                .unwrap_or_else(|e| panic!("safety violation: {}", e));
            node.applied.extend(entries);
            ClusterAuditor::check_gap_free(server.log())
                .unwrap_or_else(|e| panic!("{}: {}", server.id(), e));
        }
    }
}
