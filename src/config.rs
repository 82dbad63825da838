use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level node configuration, loadable from a TOML file or built from defaults
/// plus CLI overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

/// Static cluster membership plus timing knobs for the consensus module.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub node_id: u64,
    pub members: HashMap<u64, SocketAddr>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub raft: RaftTiming,
}

impl ClusterConfig {
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn peers(&self) -> impl Iterator<Item = (&u64, &SocketAddr)> {
        self.members.iter().filter(move |(id, _)| **id != self.node_id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaftTiming {
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_vote_deadline_ms")]
    pub vote_rpc_deadline_ms: u64,
    #[serde(default = "default_append_deadline_ms")]
    pub append_entries_deadline_ms: u64,
    #[serde(default = "default_health_deadline_ms")]
    pub health_probe_deadline_ms: u64,
}

impl Default for RaftTiming {
    fn default() -> Self {
        RaftTiming {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            tick_ms: default_tick_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            vote_rpc_deadline_ms: default_vote_deadline_ms(),
            append_entries_deadline_ms: default_append_deadline_ms(),
            health_probe_deadline_ms: default_health_deadline_ms(),
        }
    }
}

impl RaftTiming {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn vote_deadline(&self) -> Duration {
        Duration::from_millis(self.vote_rpc_deadline_ms)
    }

    pub fn append_entries_deadline(&self) -> Duration {
        Duration::from_millis(self.append_entries_deadline_ms)
    }

    pub fn health_probe_deadline(&self) -> Duration {
        Duration::from_millis(self.health_probe_deadline_ms)
    }
}

fn default_data_dir() -> String {
    ".".to_string()
}
fn default_election_timeout_min_ms() -> u64 {
    2000
}
fn default_election_timeout_max_ms() -> u64 {
    4000
}
fn default_heartbeat_interval_ms() -> u64 {
    500
}
fn default_tick_ms() -> u64 {
    100
}
fn default_reconcile_interval_ms() -> u64 {
    10_000
}
fn default_vote_deadline_ms() -> u64 {
    500
}
fn default_append_deadline_ms() -> u64 {
    200
}
fn default_health_deadline_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_rows_per_request")]
    pub rows_per_request: u32,
    #[serde(default = "default_max_cars")]
    pub max_cars: u32,
    #[serde(default = "default_min_mileage")]
    pub min_mileage: f64,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: default_base_url(),
            api_key: String::new(),
            rows_per_request: default_rows_per_request(),
            max_cars: default_max_cars(),
            min_mileage: default_min_mileage(),
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

fn default_base_url() -> String {
    "https://mc-api.marketcheck.com/v2/search/car/active".to_string()
}
fn default_rows_per_request() -> u32 {
    50
}
fn default_max_cars() -> u32 {
    500
}
fn default_min_mileage() -> f64 {
    6213.0
}
fn default_cache_ttl_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_members() -> HashMap<u64, SocketAddr> {
    [
        (217, "127.0.0.1:8217"),
        (536, "127.0.0.1:8536"),
        (657, "127.0.0.1:8657"),
        (777, "127.0.0.1:8777"),
        (888, "127.0.0.1:8888"),
    ]
    .into_iter()
    .map(|(id, addr)| (id, addr.parse().unwrap()))
    .collect()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {path}"))?;
        Ok(config)
    }

    /// Default five-node cluster matching the original deployment's static membership.
    pub fn default_for_node(node_id: u64) -> Result<Self> {
        let members = default_members();
        let bind_addr = *members
            .get(&node_id)
            .with_context(|| format!("node id {node_id} not in cluster membership"))?;

        Ok(Config {
            server: ServerConfig { bind_addr },
            cluster: ClusterConfig {
                node_id,
                members,
                data_dir: default_data_dir(),
                raft: RaftTiming::default(),
            },
            upstream: UpstreamConfig::default(),
            logging: LogConfig::default(),
        })
    }
}
