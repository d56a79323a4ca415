mod common;

use common::Cluster;
use raftline::raft::{AppendOutcome, Member, NodeState, StartMode};
use raftline::util::errors::RaftError;

#[test]
fn test_member_joins_then_leaves() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 41);
    cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));

    let contacts = vec![
        Member::active("node-1"),
        Member::active("node-2"),
        Member::active("node-3"),
    ];
    cluster.add_node("node-4", contacts, StartMode::Join);
    assert_eq!(cluster.server("node-4").role(), NodeState::Passive);

    let mut joining = cluster.server_mut("node-4").join(Member::active("node-4"));
    let mut result = None;
    assert!(cluster.run_until(2_000, |_| {
        result = joining.try_result();
        result.is_some()
    }));
    let configuration = result.expect("decided").expect("join accepted");
    assert!(configuration.contains("node-4"));
    assert!(!configuration.is_joint());

    assert!(cluster.run_until(1_000, |c| c.converged()));
    assert_eq!(cluster.server("node-4").role(), NodeState::Follower);
    let leader = cluster.leader().expect("leader");
    let committed = cluster.server(&leader).committed_configuration().clone();
    assert!(!committed.is_joint());
    assert_eq!(committed.members.len(), 4);
    assert_eq!(
        cluster.server("node-4").commit_index(),
        cluster.server(&leader).commit_index()
    );

    let mut leaving = cluster.server_mut(&leader).leave("node-4".to_string());
    let mut result = None;
    assert!(cluster.run_until(2_000, |_| {
        result = leaving.try_result();
        result.is_some()
    }));
    let configuration = result.expect("decided").expect("leave accepted");
    assert!(!configuration.contains("node-4"));
    assert!(cluster.run_until(500, |c| c.server("node-4").has_left()));
    assert_eq!(cluster.server("node-4").role(), NodeState::Inactive);

    let mut handle = cluster.append(&leader);
    let mut outcome = None;
    assert!(cluster.run_until(500, |_| {
        outcome = handle.try_outcome();
        outcome.is_some()
    }));
    assert!(matches!(outcome, Some(AppendOutcome::Committed(_))));
    assert_eq!(
        cluster.server(&leader).committed_configuration().members.len(),
        3
    );
}

#[test]
fn test_leave_rejected_without_reachable_quorum() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 42);
    let leader = cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    let followers: Vec<String> = cluster.ids().into_iter().filter(|id| id != &leader).collect();

    cluster.crash(&followers[0]);
    cluster.run(80);
    assert!(cluster.server(&leader).is_leader());

    // The remaining configuration would need the crashed member to commit
    let mut handle = cluster.server_mut(&leader).leave(followers[1].clone());
    assert!(matches!(
        handle.try_result(),
        Some(Err(RaftError::Rejected(_)))
    ));
    assert_eq!(cluster.server(&leader).configuration().members.len(), 3);
}

#[test]
fn test_force_configure_lone_survivor() {
    let mut cluster = Cluster::new(&["node-1", "node-2", "node-3"], 43);
    cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    cluster.crash("node-2");
    cluster.crash("node-3");

    let mut handle = cluster
        .server_mut("node-1")
        .force_configure(vec![Member::active("node-1")]);
    let forced = handle.try_result().expect("decided").expect("accepted");
    assert!(forced.force);

    let found = cluster.run_until(1_000, |c| {
        let s = c.server("node-1");
        s.is_leader() && s.is_ready() && !s.committed_configuration().force
    });
    assert!(found);
    assert_eq!(
        cluster.server("node-1").committed_configuration().voters(),
        vec!["node-1".to_string()]
    );

    let mut appended = cluster.append("node-1");
    assert!(cluster.run_until(100, |_| appended.try_outcome().is_some()));
    assert!(cluster.run_until(100, |c| c.converged()));
}

#[test]
fn test_force_configure_two_of_five_survivors() {
    let ids = ["node-1", "node-2", "node-3", "node-4", "node-5"];
    let mut cluster = Cluster::new(&ids, 44);
    cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    for id in &ids[2..] {
        cluster.crash(id);
    }

    let survivors = vec![Member::active("node-1"), Member::active("node-2")];
    let mut handle = cluster.server_mut("node-1").force_configure(survivors.clone());
    let mut result = None;
    assert!(cluster.run_until(500, |_| {
        result = handle.try_result();
        result.is_some()
    }));
    assert!(result.expect("decided").is_ok());

    let found = cluster.run_until(2_000, |c| {
        c.leader().map_or(false, |l| {
            let s = c.server(&l);
            s.is_ready() && !s.committed_configuration().force
        })
    });
    assert!(found);
    assert!(cluster.run_until(500, |c| c.converged()));

    // Forcing the configuration already in place changes nothing
    let term = cluster.server("node-1").term();
    let mut again = cluster.server_mut("node-1").force_configure(survivors);
    assert!(again.try_result().expect("decided").is_ok());
    assert_eq!(cluster.server("node-1").term(), term);

    let leader = cluster.leader().expect("leader");
    let mut appended = cluster.append(&leader);
    let mut outcome = None;
    assert!(cluster.run_until(500, |_| {
        outcome = appended.try_outcome();
        outcome.is_some()
    }));
    assert!(matches!(outcome, Some(AppendOutcome::Committed(_))));
    for id in ["node-1", "node-2"] {
        assert_eq!(
            cluster.server(id).committed_configuration().voters().len(),
            2
        );
    }
}

#[test]
fn test_repeated_leave_completes_with_the_first() {
    let ids = ["node-1", "node-2", "node-3", "node-4", "node-5"];
    let mut cluster = Cluster::new(&ids, 45);
    let leader = cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    let victim = cluster
        .ids()
        .into_iter()
        .find(|id| id != &leader)
        .expect("a follower");

    let mut first = cluster.server_mut(&leader).leave(victim.clone());
    let mut second = cluster.server_mut(&leader).leave(victim.clone());
    let (mut a, mut b) = (None, None);
    assert!(cluster.run_until(2_000, |_| {
        if a.is_none() {
            a = first.try_result();
        }
        if b.is_none() {
            b = second.try_result();
        }
        a.is_some() && b.is_some()
    }));
    let a = a.expect("decided").expect("first leave accepted");
    let b = b.expect("decided").expect("second leave accepted");
    assert_eq!(a, b);
    assert_eq!(a.members.len(), 4);
    assert!(!a.contains(&victim));

    // Once the member is gone a further leave answers at once
    let mut third = cluster.server_mut(&leader).leave(victim.clone());
    assert_eq!(third.try_result().expect("decided").expect("accepted"), a);
}

#[test]
fn test_force_configure_retry_while_in_flight() {
    let ids = ["node-1", "node-2", "node-3", "node-4", "node-5"];
    let mut cluster = Cluster::new(&ids, 46);
    cluster.await_leader(1_000);
    assert!(cluster.run_until(500, |c| c.converged()));
    for id in &ids[2..] {
        cluster.crash(id);
    }

    let survivors = vec![Member::active("node-1"), Member::active("node-2")];
    let mut first = cluster.server_mut("node-1").force_configure(survivors.clone());
    assert!(first.try_result().is_none());
    let term = cluster.server("node-1").term();
    let mut retry = cluster.server_mut("node-1").force_configure(survivors);
    assert_eq!(cluster.server("node-1").term(), term);

    let (mut a, mut b) = (None, None);
    assert!(cluster.run_until(500, |_| {
        if a.is_none() {
            a = first.try_result();
        }
        if b.is_none() {
            b = retry.try_result();
        }
        a.is_some() && b.is_some()
    }));
    let a = a.expect("decided").expect("force accepted");
    let b = b.expect("decided").expect("retry accepted");
    assert_eq!(a, b);
    assert!(a.force);
    assert_eq!(a.voters().len(), 2);
}
