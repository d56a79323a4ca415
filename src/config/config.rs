use crate::raft::configuration::Member;
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Unique identifier for this node
    pub node_id: String,

    /// Minimum election timeout in milliseconds (e.g., 150)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (e.g., 300)
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds (e.g., 50)
    /// Should be much less than election timeout
    pub heartbeat_interval_ms: u64,

    /// Granularity of the member's logical clock
    pub tick_interval_ms: u64,

    /// How long a replication request may stay unanswered before it is resent
    pub request_timeout_ms: u64,

    /// Deadline for join, leave and force-configure requests
    pub reconfigure_timeout_ms: u64,

    /// A leader that heard from no quorum for this long steps down
    pub quorum_timeout_ms: u64,

    /// Lag (in entries) above which a snapshot is sent instead of the log
    pub replication_threshold: u64,

    /// Upper bound of entries carried by one append request
    pub max_append_entries: usize,

    /// Size of the chunks a snapshot is split into
    pub snapshot_chunk_size: usize,

    /// Directory for persistent storage
    pub data_dir: PathBuf,

    /// Seed for election jitter; random when absent
    pub seed: Option<u64>,
}

impl RaftConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }

        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat_interval must be less than election_timeout_min".to_string());
        }

        if self.tick_interval_ms == 0 || self.tick_interval_ms > self.heartbeat_interval_ms {
            return Err("tick_interval must be between 1 and heartbeat_interval".to_string());
        }

        if self.request_timeout_ms < self.tick_interval_ms {
            return Err("request_timeout must be at least one tick".to_string());
        }

        if self.max_append_entries == 0 || self.snapshot_chunk_size == 0 {
            return Err("max_append_entries and snapshot_chunk_size must be positive".to_string());
        }

        if self.node_id.is_empty() {
            return Err("node_id cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            tick_interval_ms: 10,
            request_timeout_ms: 100,
            reconfigure_timeout_ms: 5_000,
            quorum_timeout_ms: 600,
            replication_threshold: 100,
            max_append_entries: 64,
            snapshot_chunk_size: 64 * 1024,
            data_dir: PathBuf::from("./data"),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberConfig {
    pub id: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub passive: bool,
}

fn default_priority() -> u32 {
    1
}

impl MemberConfig {
    pub fn to_member(&self) -> Member {
        let member = if self.passive {
            Member::passive(self.id.clone())
        } else {
            Member::active(self.id.clone())
        };
        member.with_priority(self.priority)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub members: Vec<MemberConfig>,
}

impl ClusterConfig {
    pub fn members(&self) -> Vec<Member> {
        self.members.iter().map(MemberConfig::to_member).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub raft: RaftConfig,
    pub cluster: ClusterConfig,
}

impl Config {
    /// Loads a TOML file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.raft.validate().map_err(RaftError::InvalidConfig)?;
        Ok(config)
    }
}
