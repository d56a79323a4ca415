mod common;

use common::Cluster;
use raftline::raft::rpc::{AppendEntriesRequest, RequestVoteRequest};
use raftline::raft::{
    ApplicationEntry, EntryPayload, LogEntry, Member, NodeState, RaftMessage, RaftServer, StartMode,
};
use raftline::storage::{
    LogStorage, MemoryLogStorage, MemorySnapshotStore, MemoryStateStorage, RaftStorage,
    StateStorage,
};
use raftline::util::errors::RaftError;

fn storage(log: &MemoryLogStorage, state: &MemoryStateStorage) -> RaftStorage {
    RaftStorage {
        log: Box::new(log.clone()),
        state: Box::new(state.clone()),
        snapshots: Box::new(MemorySnapshotStore::new()),
    }
}

fn members() -> Vec<Member> {
    vec![Member::active("node-1"), Member::active("node-2")]
}

#[test]
fn test_restarted_follower_catches_up_and_replays() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 21);
    let leader = cluster.await_leader(1_000);
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower");
    assert!(cluster.run_until(500, |c| c.converged()));

    cluster.crash(&follower);
    for _ in 0..5 {
        cluster.append(&leader);
    }
    let last = cluster.server(&leader).log().last_index();
    assert!(cluster.run_until(500, |c| c.server(&leader).commit_index() == last));

    cluster.restart(&follower, StartMode::Bootstrap);
    assert!(cluster.run_until(1_000, |c| c.converged()));
    assert!(cluster.server(&follower).is_ready());
    assert_eq!(cluster.server(&follower).commit_index(), last);
    // Entries committed before the crash are handed to the application again
    let replays = cluster
        .applied(&follower)
        .iter()
        .filter(|e| e.index == 1)
        .count();
    assert_eq!(replays, 2);
}

#[test]
fn test_term_is_restored_from_the_journal() {
    let mut log = MemoryLogStorage::new();
    log.append(vec![LogEntry::new(5, 1, EntryPayload::Initial)])
        .unwrap();
    log.flush().unwrap();
    let state = MemoryStateStorage::new();

    let server = RaftServer::new(
        common::config("node-1", 1),
        storage(&log, &state),
        members(),
        StartMode::Bootstrap,
    )
    .unwrap();
    assert_eq!(server.term(), 5);
    assert_eq!(state.load_term().unwrap(), 5);
}

#[test]
fn test_corrupted_journal_refuses_to_start() {
    let mut log = MemoryLogStorage::new();
    log.append(vec![LogEntry::new(1, 1, EntryPayload::Initial)])
        .unwrap();
    log.flush().unwrap();
    let payload = EntryPayload::Application(ApplicationEntry::new(1, 1, vec![9]));
    assert!(log.corrupt(1, payload));

    let result = RaftServer::new(
        common::config("node-1", 1),
        storage(&log, &MemoryStateStorage::new()),
        members(),
        StartMode::Bootstrap,
    );
    assert!(matches!(result, Err(RaftError::Corruption(_))));
}

#[test]
fn test_lost_committed_entries_stop_the_member() {
    let log = MemoryLogStorage::new();
    let mut state = MemoryStateStorage::new();
    state.save_term(1).unwrap();
    state.save_commit_index(5).unwrap();

    let mut server = RaftServer::new(
        common::config("node-1", 1),
        storage(&log, &state),
        members(),
        StartMode::Bootstrap,
    )
    .unwrap();
    server.start();
    server.handle(
        "node-2".to_string(),
        RaftMessage::AppendEntries(AppendEntriesRequest {
            term: 1,
            leader_id: "node-2".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 1,
            request_id: 1,
        }),
    );

    assert!(matches!(server.fatal_error(), Some(RaftError::DataLoss(_))));
    assert_eq!(server.role(), NodeState::Inactive);
    // A stopped member ignores everything
    server.tick();
    assert!(server.take_outbox().is_empty());
}

#[test]
fn test_recovering_member_votes_only_once_caught_up() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 22);
    let leader = cluster.await_leader(1_000);
    for _ in 0..3 {
        cluster.append(&leader);
    }
    assert!(cluster.run_until(500, |c| c.converged()));
    let followers: Vec<String> = cluster.ids().into_iter().filter(|id| id != &leader).collect();
    let (recovering, other) = (&followers[0], &followers[1]);

    cluster.crash(recovering);
    cluster.wipe(recovering);
    cluster.restart(recovering, StartMode::Recover);

    let term = cluster.server(&leader).term();
    let vote = |term, last_log_index, last_log_term| {
        RaftMessage::RequestVote(RequestVoteRequest {
            term,
            candidate_id: other.clone(),
            last_log_index,
            last_log_term,
        })
    };
    let replies = cluster.handle_direct(recovering, other, vote(term, 100, term));
    assert!(replies.iter().any(|e| matches!(
        &e.message,
        RaftMessage::RequestVoteResponse(r) if !r.vote_granted
    )));

    assert!(cluster.run_until(1_000, |c| c.server(recovering).is_ready()));
    let server = cluster.server(recovering);
    let (last_index, last_term) = (server.log().last_index(), server.log().last_term());
    let replies = cluster.handle_direct(recovering, other, vote(term + 1, last_index, last_term));
    assert!(replies.iter().any(|e| matches!(
        &e.message,
        RaftMessage::RequestVoteResponse(r) if r.vote_granted
    )));
}

#[test]
fn test_crash_with_unflushed_entries_recovers() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 23);
    let leader = cluster.await_leader(1_000);
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower");
    assert!(cluster.run_until(500, |c| c.converged()));

    cluster.nodes[&follower].disk.flush.set_failing(true);
    for _ in 0..5 {
        cluster.append(&leader);
    }
    let last = cluster.server(&leader).log().last_index();
    assert!(cluster.run_until(500, |c| c.server(&leader).commit_index() == last));
    assert!(cluster.server(&follower).log().last_flushed_index() < last);

    cluster.crash(&follower);
    cluster.nodes[&follower].disk.flush.set_failing(false);
    assert!(cluster.node(&follower).disk.log.last_index() < last);

    cluster.restart(&follower, StartMode::Bootstrap);
    assert!(cluster.run_until(1_000, |c| c.converged()));
    assert!(cluster.server(&follower).fatal_error().is_none());
    assert_eq!(cluster.server(&follower).commit_index(), last);
}

#[test]
fn test_wiped_and_stale_members_cannot_form_a_quorum() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 24);
    let leader = cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    let followers: Vec<String> = cluster.ids().into_iter().filter(|id| id != &leader).collect();
    let (wiped, stale) = (followers[0].clone(), followers[1].clone());

    cluster.crash(&stale);
    for _ in 0..10 {
        cluster.append(&leader);
    }
    let last = cluster.server(&leader).log().last_index();
    assert!(cluster.run_until(500, |c| c.server(&leader).commit_index() == last));
    let snapshot = cluster
        .server_mut(&leader)
        .take_snapshot(last, &[3; 40])
        .unwrap();
    cluster.run(1);
    assert_eq!(cluster.server(&leader).log().first_index(), last + 1);

    // Only the leader still holds the last committed entries
    cluster.crash(&wiped);
    cluster.wipe(&wiped);
    cluster.partition(&[&[leader.as_str()][..], &[wiped.as_str(), stale.as_str()][..]]);
    cluster.restart(&wiped, StartMode::Recover);
    cluster.restart(&stale, StartMode::Bootstrap);
    let stale_commit = cluster.server(&stale).commit_index();
    assert!(stale_commit < last);

    for _ in 0..200 {
        cluster.step();
        for id in [&wiped, &stale] {
            let server = cluster.server(id);
            assert!(!server.is_leader(), "{} must not lead", id);
            assert!(server.commit_index() <= stale_commit);
        }
        assert!(!cluster.server(&wiped).is_ready());
    }

    cluster.heal();
    let mut ready_without_snapshot = false;
    assert!(cluster.run_until(2_000, |c| {
        let server = c.server(&wiped);
        if server.is_ready() && server.snapshot_meta().is_none() {
            ready_without_snapshot = true;
        }
        server.is_ready()
    }));
    assert!(!ready_without_snapshot);
    let server = cluster.server(&wiped);
    assert_eq!(server.snapshot_meta().map(|m| m.index), Some(snapshot.index));
    assert!(server.commit_index() >= last);
    assert!(cluster.run_until(1_000, |c| c.converged()));
}
