use std::time::Duration;

use actix::prelude::*;

use raftline::config::RaftConfig;
use raftline::network::{GetNetworkStats, Heal, LocalNetwork, Partition, RegisterMember};
use raftline::raft::actor::{GetState, RaftActor, SetNetworkAddress, Shutdown, SubmitEntry};
use raftline::raft::{
    AppendOutcome, ApplicationEntry, Member, NodeId, NodeState, RaftServer, StartMode,
};
use raftline::storage::RaftStorage;

const IDS: [&str; 3] = ["node-1", "node-2", "node-3"];

async fn start_cluster(network: &Addr<LocalNetwork>) -> Vec<(NodeId, Addr<RaftActor>)> {
    let members: Vec<Member> = IDS.iter().map(|id| Member::active(*id)).collect();
    let mut actors = Vec::new();
    for (i, id) in IDS.iter().enumerate() {
        let config = RaftConfig {
            node_id: id.to_string(),
            seed: Some(i as u64 + 1),
            ..RaftConfig::default()
        };
        let tick_interval = config.tick_interval();
        let server = RaftServer::new(
            config,
            RaftStorage::in_memory(),
            members.clone(),
            StartMode::Bootstrap,
        )
        .unwrap();
        let addr = RaftActor::new(server, tick_interval).start();
        network
            .send(RegisterMember {
                id: id.to_string(),
                addr: addr.clone().recipient(),
            })
            .await
            .unwrap();
        addr.send(SetNetworkAddress {
            addr: network.clone().recipient(),
        })
        .await
        .unwrap();
        actors.push((id.to_string(), addr));
    }
    actors
}

/// Polls until one of `candidates` leads with its initial entry committed.
async fn wait_for_leader(
    actors: &[(NodeId, Addr<RaftActor>)],
    candidates: &[&str],
) -> (NodeId, Addr<RaftActor>) {
    for _ in 0..500 {
        for (id, addr) in actors.iter().filter(|(id, _)| candidates.contains(&id.as_str())) {
            let state = addr.send(GetState).await.unwrap();
            if state.state == NodeState::Leader && state.ready {
                return (id.clone(), addr.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no leader among {:?}", candidates);
}

#[actix_rt::test]
async fn test_actor_cluster_commits_and_survives_partition() {
    let network = LocalNetwork::new(99).start();
    let actors = start_cluster(&network).await;

    let (leader, leader_addr) = wait_for_leader(&actors, &IDS).await;
    let handle = leader_addr
        .send(SubmitEntry {
            entry: ApplicationEntry::new(1, 1, b"first".to_vec()),
        })
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("commit in time");
    assert!(matches!(outcome, AppendOutcome::Committed(_)));

    let others: Vec<&str> = IDS.iter().copied().filter(|id| *id != leader).collect();
    network
        .send(Partition {
            groups: vec![
                vec![leader.clone()],
                others.iter().map(|id| id.to_string()).collect(),
            ],
        })
        .await
        .unwrap();

    let (new_leader, new_addr) = wait_for_leader(&actors, &others).await;
    assert_ne!(new_leader, leader);
    let handle = new_addr
        .send(SubmitEntry {
            entry: ApplicationEntry::new(2, 2, b"second".to_vec()),
        })
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("commit in time");
    assert!(matches!(outcome, AppendOutcome::Committed(_)));

    network.send(Heal).await.unwrap();
    let stats = network.send(GetNetworkStats).await.unwrap();
    assert!(stats.dropped > 0);
    assert!(stats.delivered > 0);

    let mut caught_up = false;
    for _ in 0..500 {
        let leader_state = new_addr.send(GetState).await.unwrap();
        let old = &actors.iter().find(|(id, _)| id == &leader).expect("old leader").1;
        let old_state = old.send(GetState).await.unwrap();
        if old_state.state == NodeState::Follower
            && old_state.commit_index == leader_state.commit_index
        {
            caught_up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(caught_up);

    for (_, addr) in &actors {
        let _ = addr.send(Shutdown).await;
    }
}
