//! Resolved runtime configuration of one cluster node

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PeerAddress;

/// Cluster node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's server name (must be unique across the cluster)
    pub server_name: String,
    /// Local address both sockets are bound on
    pub bind: PeerAddress,
    /// Peers connected at startup
    pub peers: Vec<PeerAddress>,
    /// Coalescing window for `_clusterAddPeers` announcements
    pub announce_debounce: Duration,
    /// Delay before a `_clusterRequestState` is sent
    pub resync_delay: Duration,
    /// Wait between the leaving announcement and socket teardown
    pub settle_delay: Duration,
    /// Capacity of the inbound frame channel
    pub channel_capacity: usize,
}

impl ClusterConfig {
    pub fn new(server_name: impl Into<String>, bind: PeerAddress) -> Self {
        Self {
            server_name: server_name.into(),
            bind,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(Error::InvalidConfig("server_name must not be empty".into()));
        }
        if self.bind.host.is_empty() {
            return Err(Error::InvalidConfig("bind host must not be empty".into()));
        }
        if self.bind.pubsub_port != 0 && self.bind.pubsub_port == self.bind.pipeline_port {
            return Err(Error::InvalidConfig(format!(
                "pubsub and pipeline ports must differ (both {})",
                self.bind.pubsub_port
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            bind: PeerAddress::new("127.0.0.1"),
            peers: Vec::new(),
            announce_debounce: Duration::from_millis(crate::DEFAULT_ANNOUNCE_DEBOUNCE_MS),
            resync_delay: Duration::from_millis(crate::DEFAULT_RESYNC_DELAY_MS),
            settle_delay: Duration::from_millis(crate::DEFAULT_SETTLE_DELAY_MS),
            channel_capacity: crate::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// `<hostname>-<8 hex chars>`, unique enough for several nodes per host
pub fn default_server_name() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "tether-node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
