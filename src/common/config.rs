//! Configuration for trinode nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Identity of one of the three cooperating nodes.
///
/// The declaration order is the failover hierarchy: MAIN > NODE_A > NODE_B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    #[serde(rename = "MAIN", alias = "main")]
    Main,
    #[serde(rename = "NODE_A", alias = "node_a")]
    NodeA,
    #[serde(rename = "NODE_B", alias = "node_b")]
    NodeB,
}

impl NodeId {
    pub const ALL: [NodeId; 3] = [NodeId::Main, NodeId::NodeA, NodeId::NodeB];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Main => "MAIN",
            NodeId::NodeA => "NODE_A",
            NodeId::NodeB => "NODE_B",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            NodeId::Main => "Main",
            NodeId::NodeA => "Node A",
            NodeId::NodeB => "Node B",
        }
    }

    /// Only MAIN evaluates and repairs its peers.
    pub fn is_coordinator(&self) -> bool {
        matches!(self, NodeId::Main)
    }

    /// The other two nodes, in hierarchy order.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        NodeId::ALL.into_iter().filter(move |n| n != self)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "MAIN" => Ok(NodeId::Main),
            "NODE_A" | "A" => Ok(NodeId::NodeA),
            "NODE_B" | "B" => Ok(NodeId::NodeB),
            other => Err(crate::Error::InvalidConfig(format!("unknown node: {}", other))),
        }
    }
}

/// Persisted mode of NODE_A (`node_config.node_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMode {
    #[default]
    Vice,
    ActingMaster,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Vice => "VICE",
            NodeMode::ActingMaster => "ACTING_MASTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VICE" => Some(NodeMode::Vice),
            "ACTING_MASTER" => Some(NodeMode::ActingMaster),
            _ => None,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which node this process is
    pub node: NodeId,

    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Base URLs of all three nodes
    #[serde(default)]
    pub peers: PeerUrls,

    /// Title database backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// RocksDB directory of the transaction log
    #[serde(default = "default_txlog_path")]
    pub txlog_path: PathBuf,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// NODE_A holds titles with `start_year` below this, NODE_B the rest
    #[serde(default = "default_partition_split_year")]
    pub partition_split_year: i32,

    /// Node tried first by `get_best_read_node`
    #[serde(default = "default_preferred_read_node")]
    pub preferred_read_node: NodeId,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}
fn default_txlog_path() -> PathBuf {
    PathBuf::from("./txlog")
}
fn default_partition_split_year() -> i32 {
    2010
}
fn default_preferred_read_node() -> NodeId {
    NodeId::Main
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerUrls {
    pub main: String,
    pub node_a: String,
    pub node_b: String,
}

impl Default for PeerUrls {
    fn default() -> Self {
        Self {
            main: "http://127.0.0.1:5000".to_string(),
            node_a: "http://127.0.0.1:5001".to_string(),
            node_b: "http://127.0.0.1:5002".to_string(),
        }
    }
}

impl PeerUrls {
    pub fn url_of(&self, node: NodeId) -> &str {
        let url = match node {
            NodeId::Main => &self.main,
            NodeId::NodeA => &self.node_a,
            NodeId::NodeB => &self.node_b,
        };
        url.trim_end_matches('/')
    }

    pub fn set(&mut self, node: NodeId, url: impl Into<String>) {
        let url = url.into();
        match node {
            NodeId::Main => self.main = url,
            NodeId::NodeA => self.node_a = url,
            NodeId::NodeB => self.node_b = url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// SQLite database file (sqlite backend only)
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./titles.db")
}
fn default_pool_size() -> u32 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_sqlite_path(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Local checks inside this window reuse the cached result
    #[serde(default = "default_local_debounce")]
    pub local_debounce_ms: u64,

    /// Background refresh interval
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Interval between background peer health rounds
    #[serde(default = "default_peer_interval")]
    pub peer_check_interval_ms: u64,

    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
}

fn default_local_debounce() -> u64 {
    1_000
}
fn default_check_interval() -> u64 {
    30_000
}
fn default_peer_interval() -> u64 {
    15_000
}
fn default_peer_timeout() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            local_debounce_ms: default_local_debounce(),
            check_interval_ms: default_check_interval(),
            peer_check_interval_ms: default_peer_interval(),
            peer_timeout_ms: default_peer_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn local_debounce(&self) -> Duration {
        Duration::from_millis(self.local_debounce_ms)
    }
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
    pub fn peer_check_interval(&self) -> Duration {
        Duration::from_millis(self.peer_check_interval_ms)
    }
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_ms: u64,
}

fn default_relay_timeout() -> u64 {
    30_000
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            relay_timeout_ms: default_relay_timeout(),
        }
    }
}

impl ForwardingConfig {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Run the blocking startup pass
    #[serde(default = "default_true")]
    pub on_startup: bool,

    #[serde(default = "default_recovery_interval")]
    pub interval_secs: u64,

    /// Periodic passes only replay log entries this recent
    #[serde(default = "default_periodic_window")]
    pub periodic_window_secs: u64,

    /// PENDING entries younger than this may still be in flight and are not replayed
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,

    /// Row count difference tolerated before a bulk sync
    #[serde(default = "default_diff_tolerance")]
    pub diff_tolerance: u64,
}

fn default_true() -> bool {
    true
}
fn default_recovery_interval() -> u64 {
    300
}
fn default_periodic_window() -> u64 {
    900
}
fn default_pending_grace() -> u64 {
    60
}
fn default_diff_tolerance() -> u64 {
    5
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            on_startup: true,
            interval_secs: default_recovery_interval(),
            periodic_window_secs: default_periodic_window(),
            pending_grace_secs: default_pending_grace(),
            diff_tolerance: default_diff_tolerance(),
        }
    }
}

impl Config {
    /// Default configuration for a given node
    pub fn for_node(node: NodeId) -> Self {
        let port = match node {
            NodeId::Main => 5000,
            NodeId::NodeA => 5001,
            NodeId::NodeB => 5002,
        };
        Self {
            node,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            peers: PeerUrls::default(),
            storage: StorageConfig::default(),
            txlog_path: default_txlog_path(),
            health: HealthConfig::default(),
            forwarding: ForwardingConfig::default(),
            recovery: RecoveryConfig::default(),
            partition_split_year: default_partition_split_year(),
            preferred_read_node: default_preferred_read_node(),
            log_level: default_log_level(),
        }
    }

    /// Load from an optional TOML file, then `TRINODE_*` environment variables
    /// (nested keys use `__`, e.g. `TRINODE_HEALTH__PEER_TIMEOUT_MS`).
    pub fn load(path: Option<&Path>, node: NodeId) -> crate::Result<Self> {
        let defaults = config::Config::try_from(&Config::for_node(node))
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("trinode").required(false)),
        };
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("TRINODE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> crate::Result<()> {
        for node in NodeId::ALL {
            let url = self.peers.url_of(node);
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(crate::Error::InvalidConfig(format!(
                    "URL of {} must be http(s): {}",
                    node, url
                )));
            }
        }
        if self.health.peer_timeout_ms == 0 || self.forwarding.relay_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.health.check_interval_ms == 0 || self.health.peer_check_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "health check intervals must be non-zero".into(),
            ));
        }
        if self.recovery.interval_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "recovery interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn self_url(&self) -> &str {
        self.peers.url_of(self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_and_display() {
        assert_eq!("main".parse::<NodeId>().unwrap(), NodeId::Main);
        assert_eq!("node-a".parse::<NodeId>().unwrap(), NodeId::NodeA);
        assert_eq!("B".parse::<NodeId>().unwrap(), NodeId::NodeB);
        assert!("node_c".parse::<NodeId>().is_err());
        assert_eq!(NodeId::NodeA.to_string(), "NODE_A");
        assert_eq!(serde_json::to_string(&NodeId::NodeB).unwrap(), "\"NODE_B\"");
    }

    #[test]
    fn test_peers_in_hierarchy_order() {
        let peers: Vec<_> = NodeId::NodeA.peers().collect();
        assert_eq!(peers, vec![NodeId::Main, NodeId::NodeB]);
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::for_node(NodeId::NodeB);
        assert_eq!(config.bind_addr.port(), 5002);
        assert_eq!(config.recovery.diff_tolerance, 5);
        assert_eq!(config.health.peer_timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = Config::for_node(NodeId::Main);
        config.health.peer_check_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::for_node(NodeId::Main);
        config.health.check_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_url_rejected() {
        let mut config = Config::for_node(NodeId::Main);
        config.peers.set(NodeId::NodeA, "localhost:5001");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_url_trailing_slash_trimmed() {
        let mut peers = PeerUrls::default();
        peers.set(NodeId::Main, "http://main:5000/");
        assert_eq!(peers.url_of(NodeId::Main), "http://main:5000");
    }
}
