//! WolfRing Configuration
//!
//! This module provides configuration structures for a WolfRing node:
//! addressing, protocol timings, the reliable transfer channel, the
//! status API and logging.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

/// Default port nodes listen on and broadcast START to
pub const DEFAULT_LISTEN_PORT: u16 = 4711;

/// Main WolfRing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WolfRingConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Membership protocol configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Reliable file transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP port for membership traffic
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Interface to bind the membership socket on
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Address other nodes see us as (detected when unset)
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,
}

/// Membership protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// START broadcasts before self-promotion
    #[serde(default = "default_join_attempts")]
    pub join_attempts: u32,

    /// Wait between START broadcasts in milliseconds
    #[serde(default = "default_join_interval_ms")]
    pub join_interval_ms: u64,

    /// HEALTH send interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Leader silence tolerated before starting an election, in milliseconds
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,

    /// Heartbeat age after which the leader evicts a member, in milliseconds
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Leader liveness sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Time an initiator waits for its election round before retrying
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Upper bound of the random delay added to each election retry
    #[serde(default = "default_election_jitter_ms")]
    pub election_jitter_ms: u64,

    /// Destination address for START broadcasts
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,

    /// Ports START is broadcast to
    #[serde(default = "default_discovery_ports")]
    pub discovery_ports: Vec<u16>,
}

/// Reliable file transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Enable the TCP transfer listener
    #[serde(default)]
    pub enabled: bool,

    /// Bind address (defaults to the membership port on all interfaces)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Directory received files are stored in
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Compress outgoing uploads with LZ4
    #[serde(default = "default_true")]
    pub compress: bool,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_join_attempts() -> u32 {
    5
}

fn default_join_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_leader_timeout_ms() -> u64 {
    3000
}

fn default_liveness_timeout_ms() -> u64 {
    5000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_election_timeout_ms() -> u64 {
    3000
}

fn default_election_jitter_ms() -> u64 {
    1000
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_discovery_ports() -> Vec<u16> {
    vec![DEFAULT_LISTEN_PORT]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfring/files")
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8471".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_ip: default_bind_ip(),
            advertise_ip: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            join_attempts: default_join_attempts(),
            join_interval_ms: default_join_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            leader_timeout_ms: default_leader_timeout_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            election_jitter_ms: default_election_jitter_ms(),
            broadcast_address: default_broadcast_address(),
            discovery_ports: default_discovery_ports(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: None,
            data_dir: default_data_dir(),
            compress: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Get join retry interval as Duration
    pub fn join_interval(&self) -> Duration {
        Duration::from_millis(self.join_interval_ms)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get leader timeout as Duration
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    /// Get liveness timeout as Duration
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Get election timeout as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Get election jitter bound as Duration
    pub fn election_jitter(&self) -> Duration {
        Duration::from_millis(self.election_jitter_ms)
    }

    /// Every (broadcast address, port) START goes to
    pub fn discovery_targets(&self) -> Vec<SocketAddr> {
        self.discovery_ports
            .iter()
            .map(|port| SocketAddr::new(self.broadcast_address, *port))
            .collect()
    }
}

impl WolfRingConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfRingConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.listen_port == 0 {
            return Err(crate::Error::Config("node.listen_port cannot be 0".into()));
        }

        let cluster = &self.cluster;
        if cluster.join_attempts == 0 {
            return Err(crate::Error::Config("cluster.join_attempts must be at least 1".into()));
        }

        if cluster.heartbeat_interval_ms == 0 || cluster.sweep_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms and cluster.sweep_interval_ms must be positive".into(),
            ));
        }

        // A single lost heartbeat must never evict a member
        if cluster.liveness_timeout_ms < cluster.heartbeat_interval_ms * 2 {
            return Err(crate::Error::Config(format!(
                "cluster.liveness_timeout_ms ({}) must be at least twice heartbeat_interval_ms ({})",
                cluster.liveness_timeout_ms, cluster.heartbeat_interval_ms
            )));
        }

        if cluster.leader_timeout_ms <= cluster.heartbeat_interval_ms {
            return Err(crate::Error::Config(format!(
                "cluster.leader_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                cluster.leader_timeout_ms, cluster.heartbeat_interval_ms
            )));
        }

        if cluster.discovery_ports.is_empty() {
            return Err(crate::Error::Config("cluster.discovery_ports cannot be empty".into()));
        }

        if self.transfer.enabled && self.transfer.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("transfer.data_dir cannot be empty".into()));
        }

        Ok(())
    }

    /// Address the UDP socket binds to
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.node.bind_ip, self.node.listen_port)
    }

    /// Address the transfer listener binds to
    pub fn transfer_address(&self) -> String {
        self.transfer
            .bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.node.listen_port))
    }

    /// The IP other nodes reach us on.
    ///
    /// Uses `node.advertise_ip` when set, otherwise asks the routing table
    /// which local address would be used to reach the broadcast address.
    /// No packet is sent.
    pub fn advertise_ip(&self) -> crate::Result<IpAddr> {
        if let Some(ip) = self.node.advertise_ip {
            return Ok(ip);
        }

        let probe = UdpSocket::bind((self.node.bind_ip, 0))
            .map_err(|e| crate::Error::AddressResolution(e.to_string()))?;
        probe
            .set_broadcast(true)
            .map_err(|e| crate::Error::AddressResolution(e.to_string()))?;
        probe
            .connect((self.cluster.broadcast_address, self.node.listen_port))
            .map_err(|e| crate::Error::AddressResolution(e.to_string()))?;
        let local = probe
            .local_addr()
            .map_err(|e| crate::Error::AddressResolution(e.to_string()))?;

        if local.ip().is_unspecified() {
            return Err(crate::Error::AddressResolution(
                "routing table returned an unspecified address; set node.advertise_ip".into(),
            ));
        }
        Ok(local.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
listen_port = 5000
advertise_ip = "10.0.10.115"

[cluster]
heartbeat_interval_ms = 200
leader_timeout_ms = 800
liveness_timeout_ms = 1000
discovery_ports = [4711, 5000]

[transfer]
enabled = true
data_dir = "/tmp/wolfring"
"#;

        let config = WolfRingConfig::from_str(toml).unwrap();
        assert_eq!(config.node.listen_port, 5000);
        assert_eq!(config.cluster.join_attempts, 5);
        assert_eq!(config.cluster.join_interval(), Duration::from_millis(500));
        assert_eq!(config.cluster.discovery_targets().len(), 2);
        assert_eq!(config.advertise_ip().unwrap().to_string(), "10.0.10.115");
        assert_eq!(config.transfer_address(), "0.0.0.0:5000");
    }

    #[test]
    fn test_defaults() {
        let config = WolfRingConfig::from_str("").unwrap();
        assert_eq!(config.node.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.cluster.discovery_ports, vec![DEFAULT_LISTEN_PORT]);
        assert_eq!(config.bind_address().to_string(), "0.0.0.0:4711");
        assert!(!config.transfer.enabled);
    }

    #[test]
    fn test_liveness_must_cover_several_heartbeats() {
        let toml = r#"
[cluster]
heartbeat_interval_ms = 1000
liveness_timeout_ms = 1500
"#;
        let err = WolfRingConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_join_attempts() {
        let err = WolfRingConfig::from_str("[cluster]\njoin_attempts = 0\n").unwrap_err();
        assert!(err.to_string().contains("join_attempts"));
    }
}
