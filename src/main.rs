use actix::prelude::*;
use anyhow::{anyhow, Context as _};
use clap::Parser;
use raftline::{
    config::{Config, RaftConfig},
    network::{LocalNetwork, RegisterMember},
    raft::{
        actor::{
            CommittedEntries, GetState, RaftActor, SetCommitListener, SetNetworkAddress,
            Shutdown, SubmitEntry,
        },
        AppendOutcome, ApplicationEntry, Member, NodeState, RaftServer, StartMode,
    },
    storage::RaftStorage,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "raftline")]
#[command(version)]
#[command(about = "Runs an in-process Raft cluster and replicates a few entries")]
struct Args {
    /// TOML configuration file; members listed there replace --members
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of members of the demo cluster
    #[arg(long, default_value = "3")]
    members: usize,

    /// Number of entries to replicate
    #[arg(long, default_value = "10")]
    entries: u64,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Logs what each member hands to the application.
struct CommitPrinter;

impl Actor for CommitPrinter {
    type Context = Context<Self>;
}

impl Handler<CommittedEntries> for CommitPrinter {
    type Result = ();

    fn handle(&mut self, msg: CommittedEntries, _ctx: &mut Context<Self>) -> Self::Result {
        for entry in msg.entries {
            tracing::debug!(
                "Node {} applied entry {} (term {})",
                msg.member,
                entry.index,
                entry.term
            );
        }
    }
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level: tracing::Level = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("invalid log level {}", args.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let (config, persistent) = match &args.config {
        Some(path) => (
            Config::load(path).with_context(|| format!("loading {}", path.display()))?,
            true,
        ),
        None => (Config::default(), false),
    };
    let mut members = config.cluster.members();
    if members.is_empty() {
        members = (1..=args.members)
            .map(|i| Member::active(format!("node-{}", i)))
            .collect();
    }
    tracing::info!(
        "Starting cluster of {} members: {:?}",
        members.len(),
        members.iter().map(|m| &m.id).collect::<Vec<_>>()
    );

    let seed = config.raft.seed.unwrap_or(0);
    let network = LocalNetwork::new(seed).start();
    let printer = CommitPrinter.start();

    let mut actors = Vec::new();
    for (i, member) in members.iter().enumerate() {
        let raft_config = RaftConfig {
            node_id: member.id.clone(),
            seed: config.raft.seed.map(|s| s + i as u64),
            ..config.raft.clone()
        };
        let storage = if persistent {
            RaftStorage::open(raft_config.data_dir.join(&member.id))
                .with_context(|| format!("opening storage of {}", member.id))?
        } else {
            RaftStorage::in_memory()
        };
        let tick_interval = raft_config.tick_interval();
        let server = RaftServer::new(raft_config, storage, members.clone(), StartMode::Bootstrap)
            .with_context(|| format!("starting {}", member.id))?;
        let addr = RaftActor::new(server, tick_interval).start();

        network
            .send(RegisterMember {
                id: member.id.clone(),
                addr: addr.clone().recipient(),
            })
            .await?;
        addr.send(SetNetworkAddress {
            addr: network.clone().recipient(),
        })
        .await?;
        addr.send(SetCommitListener {
            addr: printer.clone().recipient(),
        })
        .await?;
        actors.push(addr);
    }

    let leader = wait_for_leader(&actors)
        .await
        .context("no leader was elected")?;
    let leader_state = leader.send(GetState).await?;
    tracing::info!(
        "Node {} leads term {}",
        leader_state.node_id,
        leader_state.current_term
    );

    for position in 1..=args.entries {
        let handle = leader
            .send(SubmitEntry {
                entry: ApplicationEntry::new(position, position, position.to_be_bytes().to_vec()),
            })
            .await?;
        match handle.wait().await {
            AppendOutcome::Committed(index) => {
                tracing::info!("Entry {} committed at index {}", position, index)
            }
            AppendOutcome::WriteFailed(e) => tracing::warn!("Entry {} not written: {}", position, e),
            AppendOutcome::CommitFailed(index, e) => {
                tracing::warn!("Entry {} at index {} not committed: {}", position, index, e)
            }
        }
    }

    // Let followers learn the final commit index
    tokio::time::sleep(Duration::from_millis(config.raft.heartbeat_interval_ms * 3)).await;
    for addr in &actors {
        let state = addr.send(GetState).await?;
        tracing::info!(
            "Node {}: {} term={} commit={} last_index={} ready={}",
            state.node_id,
            state.state,
            state.current_term,
            state.commit_index,
            state.last_log_index,
            state.ready
        );
        addr.send(Shutdown).await?;
    }
    Ok(())
}

async fn wait_for_leader(actors: &[Addr<RaftActor>]) -> anyhow::Result<Addr<RaftActor>> {
    let search = async {
        loop {
            for addr in actors {
                let state = addr.send(GetState).await?;
                if state.state == NodeState::Leader && state.ready {
                    return Ok::<_, anyhow::Error>(addr.clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), search).await?
}
