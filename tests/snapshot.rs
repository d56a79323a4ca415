mod common;

use common::Cluster;
use raftline::raft::{AppendOutcome, LogIndex, NodeId, StartMode};

const SNAPSHOT_DATA: [u8; 100] = [7; 100];
const CHUNK_COUNT: u64 = 7;

/// A cluster whose leader compacted entries a crashed follower never saw.
fn lagging_cluster(seed: u64) -> (Cluster, NodeId, NodeId, LogIndex) {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], seed);
    let leader = cluster.await_leader(1_000);
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower");
    assert!(cluster.run_until(500, |c| c.converged()));

    cluster.crash(&follower);
    for _ in 0..30 {
        cluster.append(&leader);
    }
    let last = cluster.server(&leader).log().last_index();
    assert!(cluster.run_until(500, |c| c.server(&leader).commit_index() == last));

    let commit = cluster.server(&leader).commit_index();
    let meta = cluster
        .server_mut(&leader)
        .take_snapshot(commit, &SNAPSHOT_DATA)
        .unwrap();
    assert_eq!(u64::from(meta.chunk_count), CHUNK_COUNT);
    cluster.run(1);
    assert_eq!(cluster.server(&leader).log().first_index(), commit + 1);
    (cluster, leader, follower, commit)
}

fn assert_installed(cluster: &mut Cluster, follower: &str, index: LogIndex) {
    assert!(cluster.run_until(2_000, |c| c.converged()));
    let server = cluster.server(follower);
    assert_eq!(server.snapshot_meta().map(|m| m.index), Some(index));
    assert_eq!(server.log().first_index(), index + 1);
    assert!(server.commit_index() >= index);
    assert!(server.is_ready());
    assert_eq!(cluster.node(follower).disk.hook.persists(), 1);

    let leader = cluster.leader().expect("leader");
    let (next, matched) = cluster
        .server(&leader)
        .member_progress(follower)
        .expect("follower progress");
    assert!(matched >= index);
    assert_eq!(next, matched + 1);
}

#[test]
fn test_lagging_member_receives_snapshot() {
    let (mut cluster, _, follower, index) = lagging_cluster(31);
    cluster.restart(&follower, StartMode::Bootstrap);
    assert_installed(&mut cluster, &follower, index);

    let leader = cluster.leader().expect("leader");
    let mut handle = cluster.append(&leader);
    assert!(cluster.run_until(500, |c| c.converged()));
    assert!(matches!(handle.try_outcome(), Some(AppendOutcome::Committed(_))));
    assert_eq!(
        cluster.server(&follower).commit_index(),
        cluster.server(&leader).commit_index()
    );
}

#[test]
fn test_lost_chunks_are_resent() {
    let (mut cluster, _, follower, index) = lagging_cluster(32);
    cluster.restart(&follower, StartMode::Bootstrap);
    cluster.reset_sent();
    // Lose the third chunk and the acknowledgement of the fifth
    cluster.drop_after("InstallSnapshot", 2, 1);
    cluster.drop_after("InstallSnapshotResponse", 4, 1);
    assert_installed(&mut cluster, &follower, index);

    // Only the unacknowledged chunk goes out again, the transfer never restarts
    let sent = cluster.sent("InstallSnapshot");
    assert!(sent >= CHUNK_COUNT);
    assert!(sent <= CHUNK_COUNT + 2, "{} chunks sent", sent);
}

#[test]
fn test_failed_persist_restarts_transfer() {
    let (mut cluster, _, follower, index) = lagging_cluster(33);
    cluster.node(&follower).disk.hook.fail_next(1);
    cluster.restart(&follower, StartMode::Bootstrap);
    cluster.reset_sent();
    assert_installed(&mut cluster, &follower, index);

    // The rejection restarts the transfer from the first chunk exactly once
    assert_eq!(cluster.sent("InstallSnapshot"), 2 * CHUNK_COUNT);
}
