//! Configuration for Tether

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{default_server_name, ClusterConfig, PeerAddress};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TetherConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::ConfigRead)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("TETHER_SERVER_NAME") {
            config.node.server_name = Some(name);
        }
        if let Ok(host) = std::env::var("TETHER_HOST") {
            config.node.bind.host = host;
        }
        if let Ok(port) = std::env::var("TETHER_PUBSUB_PORT") {
            if let Ok(p) = port.parse() {
                config.node.bind.pubsub_port = p;
            }
        }
        if let Ok(port) = std::env::var("TETHER_PIPELINE_PORT") {
            if let Ok(p) = port.parse() {
                config.node.bind.pipeline_port = p;
            }
        }
        if let Ok(peers) = std::env::var("TETHER_PEERS") {
            config.node.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect();
        }
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("TETHER_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate(&self) -> crate::Result<()> {
        if let Some(name) = &self.node.server_name {
            if name.is_empty() {
                return Err(crate::Error::InvalidConfig(
                    "node.server_name must not be empty".into(),
                ));
            }
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::InvalidConfig(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }
        self.to_cluster_config().validate()
    }

    /// Convert to ClusterConfig for the cluster module
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let server_name = self
            .node
            .server_name
            .clone()
            .unwrap_or_else(default_server_name);

        ClusterConfig {
            server_name,
            bind: self.node.bind.clone(),
            peers: self.node.peers.clone(),
            announce_debounce: Duration::from_millis(self.timing.announce_debounce_ms),
            resync_delay: Duration::from_millis(self.timing.resync_delay_ms),
            settle_delay: Duration::from_millis(self.timing.settle_delay_ms),
            channel_capacity: self.timing.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's server name (generated from the hostname if not set)
    pub server_name: Option<String>,
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: PeerAddress,
    /// Statically configured peers
    #[serde(default)]
    pub peers: Vec<PeerAddress>,
}

fn default_bind() -> PeerAddress {
    PeerAddress::new("127.0.0.1")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            bind: default_bind(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub announce_debounce_ms: u64,
    pub resync_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            announce_debounce_ms: crate::DEFAULT_ANNOUNCE_DEBOUNCE_MS,
            resync_delay_ms: crate::DEFAULT_RESYNC_DELAY_MS,
            settle_delay_ms: crate::DEFAULT_SETTLE_DELAY_MS,
            channel_capacity: crate::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TetherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.bind.pubsub_port, crate::DEFAULT_PUBSUB_PORT);
        assert_eq!(config.node.bind.pipeline_port, crate::DEFAULT_PIPELINE_PORT);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[node]
server_name = "server-A"
bind = {{ host = "10.0.0.1", pubsubPort = 7021, pipelinePort = 7022 }}
peers = [{{ host = "10.0.0.2" }}]

[timing]
settle_delay_ms = 250

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = TetherConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.node.server_name.as_deref(), Some("server-A"));
        assert_eq!(config.node.peers[0].pubsub_port, crate::DEFAULT_PUBSUB_PORT);
        assert_eq!(config.timing.resync_delay_ms, crate::DEFAULT_RESYNC_DELAY_MS);

        let cluster = config.to_cluster_config();
        assert_eq!(cluster.server_name, "server-A");
        assert_eq!(cluster.bind.pubsub_port, 7021);
        assert_eq!(cluster.settle_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_rejects_bad_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[logging]\nformat = \"xml\"\n").unwrap();
        assert!(TetherConfig::from_file(file.path().to_str().unwrap()).is_err());

        assert!(TetherConfig::from_file("/nonexistent/tether.toml").is_err());
    }
}
