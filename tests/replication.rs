mod common;

use common::Cluster;
use raftline::raft::{AppendOutcome, EntryPayload};

#[test]
fn test_entries_commit_on_every_member() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 11);
    let leader = cluster.await_leader(1_000);

    let mut handles: Vec<_> = (0..10).map(|_| cluster.append(&leader)).collect();
    assert!(cluster.run_until(500, |c| c.converged()));

    let mut previous = 0;
    for handle in handles.iter_mut() {
        match handle.try_outcome() {
            Some(AppendOutcome::Committed(index)) => {
                assert!(index > previous);
                previous = index;
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    let expected = cluster.applied(&leader).to_vec();
    assert_eq!(expected.last().map(|e| e.index), Some(previous));
    for id in cluster.ids() {
        assert_eq!(cluster.applied(&id), expected.as_slice(), "{} applied differently", id);
    }
}

#[test]
fn test_lossy_network_keeps_logs_consistent() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 12);
    cluster.set_drop_rate(0.2);
    cluster.set_duplicate_rate(0.1);
    cluster.set_reorder(true);

    let mut committed = 0;
    let mut attempts = 0;
    while committed < 20 {
        attempts += 1;
        assert!(attempts < 200, "too many failed appends");
        let leader = cluster.await_leader(5_000);
        let mut handle = cluster.append(&leader);
        let mut outcome = None;
        cluster.run_until(1_000, |_| {
            outcome = handle.try_outcome();
            outcome.is_some()
        });
        if let Some(AppendOutcome::Committed(_)) = outcome {
            committed += 1;
        }
    }

    cluster.set_drop_rate(0.0);
    cluster.set_duplicate_rate(0.0);
    cluster.set_reorder(false);
    assert!(cluster.run_until(3_000, |c| c.converged()));

    let leader = cluster.leader().expect("leader");
    let commit = cluster.server(&leader).commit_index();
    for server in cluster.running() {
        let ours = server.log().get_range(1, commit).unwrap();
        let theirs = cluster.server(&leader).log().get_range(1, commit).unwrap();
        assert_eq!(ours, theirs, "{} diverged", server.id());
    }
    let applications = cluster
        .applied(&leader)
        .iter()
        .filter(|e| e.payload.as_application().is_some())
        .count();
    assert!(applications >= 20);
}

#[test]
fn test_flush_failure_on_minority_does_not_block_commit() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 13);
    let leader = cluster.await_leader(1_000);
    let faulty = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower");
    assert!(cluster.run_until(500, |c| c.converged()));
    let before = cluster.server(&faulty).commit_index();

    cluster.nodes[&faulty].disk.flush.set_failing(true);
    let handles: Vec<_> = (0..5).map(|_| cluster.append(&leader)).collect();
    let last = cluster.server(&leader).log().last_index();
    assert!(cluster.run_until(500, |c| c.server(&leader).commit_index() == last));
    cluster.run(20);
    assert_eq!(cluster.server(&faulty).commit_index(), before);

    cluster.nodes[&faulty].disk.flush.set_failing(false);
    assert!(cluster.run_until(500, |c| c.converged()));
    assert_eq!(cluster.server(&faulty).commit_index(), last);
    drop(handles);
}

#[test]
fn test_leader_flush_failure_is_retried() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 14);
    let leader = cluster.await_leader(1_000);

    cluster.nodes[&leader].disk.flush.set_failing(true);
    let mut handle = cluster.append(&leader);
    let index = handle.index.expect("appended");
    assert!(cluster.run_until(200, |c| c.server(&leader).commit_index() >= index));
    // Committed by the followers, but not yet durable on the leader
    assert_eq!(handle.try_written(), None);

    cluster.nodes[&leader].disk.flush.set_failing(false);
    cluster.run(2);
    assert_eq!(handle.try_written(), Some(index));
    assert!(matches!(handle.try_outcome(), Some(AppendOutcome::Committed(i)) if i == index));
}

#[test]
fn test_partitioned_leader_entries_are_overwritten() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 15);
    let old_leader = cluster.await_leader(1_000);
    let old_term = cluster.server(&old_leader).term();
    cluster.append(&old_leader);
    assert!(cluster.run_until(500, |c| c.converged()));

    let others: Vec<String> = cluster.ids().into_iter().filter(|id| id != &old_leader).collect();
    let others: Vec<&str> = others.iter().map(String::as_str).collect();
    cluster.partition(&[&[old_leader.as_str()][..], &others[..]]);

    let mut stale = vec![cluster.append(&old_leader), cluster.append(&old_leader)];
    let stale_index = stale[0].index.expect("appended");

    let found = cluster.run_until(2_000, |c| {
        others.iter().any(|id| {
            let s = c.server(id);
            s.is_leader() && s.is_ready() && s.term() > old_term
        })
    });
    assert!(found);
    let new_leader = cluster.leader().expect("leader");
    assert_ne!(new_leader, old_leader);
    let mut fresh = cluster.append(&new_leader);
    assert!(cluster.run_until(500, |_| fresh.try_outcome().is_some()));

    cluster.heal();
    assert!(cluster.run_until(3_000, |c| c.converged()));

    for handle in stale.iter_mut() {
        assert!(matches!(
            handle.try_outcome(),
            Some(AppendOutcome::CommitFailed(..))
        ));
    }
    let leader = cluster.leader().expect("leader");
    let replaced = cluster
        .server(&old_leader)
        .log()
        .get(stale_index)
        .unwrap()
        .expect("entry");
    assert!(replaced.term > old_term);
    assert_eq!(replaced.payload, EntryPayload::Initial);
    assert_eq!(
        cluster.server(&old_leader).log().last_index(),
        cluster.server(&leader).log().last_index()
    );
}
