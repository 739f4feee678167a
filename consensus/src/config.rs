use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;

use crate::error::RaftError;
use crate::raft::types::ServerId;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> MutexGuard<'static, RuntimeConfig> {
    INSTANCE
        .get_or_init(|| Mutex::new(RuntimeConfig::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: ServerId,
    pub addr: String,
}

/// Tuning of a single Raft instance. Every field has a default so a config
/// file only lists what it overrides.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    /// Election timeout as a multiple of the heartbeat interval.
    pub election_timeout_factor: u64,
    /// Upper bound of the random extra delay added to each election timeout.
    pub election_timeout_variance_ms: u64,
    /// Capture a snapshot once this many entries were applied since the last one.
    pub snapshot_batch_count: u64,
    /// Capture a snapshot once the retained log exceeds this many bytes.
    pub snapshot_data_threshold: usize,
    /// Capture a snapshot at least this often while entries are applied. 0 disables.
    pub snapshot_interval_ms: u64,
    pub snapshot_chunk_size: usize,
    pub snapshot_chunk_max_retries: u32,
    pub snapshots_to_retain: usize,
    pub entries_per_segment: usize,
    pub max_entries_per_append: usize,
    pub max_append_bytes: usize,
    /// How far behind the leader a joining server may be when it is promoted.
    pub catchup_max_lag: u64,
    pub server_change_timeout_ms: u64,
    pub leadership_transfer_timeout_ms: u64,
    /// Fixed seed for election jitter, for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 100,
            election_timeout_factor: 10,
            election_timeout_variance_ms: 500,
            snapshot_batch_count: 20_000,
            snapshot_data_threshold: 16 * 1024 * 1024,
            snapshot_interval_ms: 60_000,
            snapshot_chunk_size: 2 * 1024 * 1024,
            snapshot_chunk_max_retries: 3,
            snapshots_to_retain: 2,
            entries_per_segment: 1000,
            max_entries_per_append: 1000,
            max_append_bytes: 1024 * 1024,
            catchup_max_lag: 100,
            server_change_timeout_ms: 30_000,
            leadership_transfer_timeout_ms: 2_000,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Election timeout before jitter.
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * self.election_timeout_factor)
    }

    /// Heartbeat ticks after which an unanswered snapshot chunk is resent.
    pub fn chunk_timeout_ticks(&self) -> u64 {
        self.election_timeout_factor * 3
    }

    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_ms > 0).then(|| Duration::from_millis(self.snapshot_interval_ms))
    }

    pub fn server_change_timeout(&self) -> Duration {
        Duration::from_millis(self.server_change_timeout_ms)
    }

    pub fn leadership_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.leadership_transfer_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        let invalid = |reason: &str| {
            Err(RaftError::Config {
                reason: reason.to_owned(),
            })
        };
        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be positive");
        }
        if self.election_timeout_factor < 2 {
            return invalid("election timeout must be longer than the heartbeat interval");
        }
        if self.snapshot_chunk_size == 0 {
            return invalid("snapshot_chunk_size must be positive");
        }
        if self.snapshots_to_retain == 0 {
            return invalid("snapshots_to_retain must be positive");
        }
        if self.entries_per_segment == 0 || self.max_entries_per_append == 0 {
            return invalid("segment and append batch sizes must be positive");
        }
        if self.snapshot_batch_count == 0 {
            return invalid("snapshot_batch_count must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub id: ServerId,
    pub addr: String,
    pub metrics_addr: String,
    pub data_dir: String,
    pub node_list: Vec<NodeConfig>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: "./data".to_string(),
            node_list: Vec::new(),
            raft: RaftConfig::default(),
        }
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: RuntimeConfig = toml::from_str(contents).context("parsing runtime config")?;
        config.raft.validate()?;
        if !config.node_list.iter().any(|n| n.id == config.id) {
            anyhow::bail!("node {} is not listed in node_list", config.id);
        }
        Ok(config)
    }

    /// Load the config file and publish it through [`instance`]. A missing
    /// file falls back to the defaults.
    pub fn from_toml(path: &str) -> anyhow::Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents)?,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        };
        *instance() = config.clone();
        Ok(config)
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeConfig> + '_ {
        self.node_list.iter().filter(move |n| n.id != self.id)
    }
}
