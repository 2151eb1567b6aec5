//! Peer identity: addresses, connection keys and peer hashes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEFAULT_PIPELINE_PORT, DEFAULT_PUBSUB_PORT};

fn default_pubsub_port() -> u16 {
    DEFAULT_PUBSUB_PORT
}

fn default_pipeline_port() -> u16 {
    DEFAULT_PIPELINE_PORT
}

/// Where a cluster node can be reached, optionally with its declared server name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    /// Host name or IP address
    pub host: String,
    /// Port of the node's broadcast publish socket
    #[serde(default = "default_pubsub_port")]
    pub pubsub_port: u16,
    /// Port of the node's direct pull socket
    #[serde(default = "default_pipeline_port")]
    pub pipeline_port: u16,
    /// Server name, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl PeerAddress {
    /// Address on the default ports
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pubsub_port: DEFAULT_PUBSUB_PORT,
            pipeline_port: DEFAULT_PIPELINE_PORT,
            server_name: None,
        }
    }

    pub fn with_ports(mut self, pubsub_port: u16, pipeline_port: u16) -> Self {
        self.pubsub_port = pubsub_port;
        self.pipeline_port = pipeline_port;
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Connection coordinates, independent of the server name
    pub fn connection_addr(&self) -> ConnectionAddr {
        ConnectionAddr {
            host: self.host.clone(),
            pubsub_port: self.pubsub_port,
            pipeline_port: self.pipeline_port,
        }
    }

    /// Peer hash, available once the server name is known
    pub fn key(&self) -> Option<PeerKey> {
        self.server_name
            .as_deref()
            .map(|name| PeerKey::compute(name, &self.connection_addr()))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.server_name {
            write!(f, "{}@", name)?;
        }
        write!(f, "{}:{}:{}", self.host, self.pubsub_port, self.pipeline_port)
    }
}

/// Parses `[name@]host[:pubsub_port[:pipeline_port]]`.
impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (server_name, rest) = match s.split_once('@') {
            Some((name, rest)) if !name.is_empty() => (Some(name.to_string()), rest),
            Some(_) => return Err(Error::InvalidPeerAddress(s.to_string())),
            None => (None, s),
        };

        let mut parts = rest.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidPeerAddress(s.to_string()))?;

        let parse_port = |part: Option<&str>, default: u16| -> Result<u16> {
            match part {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::InvalidPeerAddress(s.to_string())),
                None => Ok(default),
            }
        };
        let pubsub_port = parse_port(parts.next(), DEFAULT_PUBSUB_PORT)?;
        let pipeline_port = parse_port(parts.next(), DEFAULT_PIPELINE_PORT)?;

        if parts.next().is_some() {
            return Err(Error::InvalidPeerAddress(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            pubsub_port,
            pipeline_port,
            server_name,
        })
    }
}

/// Key under which sockets to a peer are tracked
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAddr {
    pub host: String,
    pub pubsub_port: u16,
    pub pipeline_port: u16,
}

impl ConnectionAddr {
    /// `host:port` of the broadcast publish socket
    pub fn pubsub_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.pubsub_port)
    }

    /// `host:port` of the direct pull socket
    pub fn pipeline_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.pipeline_port)
    }

    pub fn to_peer_address(&self) -> PeerAddress {
        PeerAddress {
            host: self.host.clone(),
            pubsub_port: self.pubsub_port,
            pipeline_port: self.pipeline_port,
            server_name: None,
        }
    }
}

impl fmt::Display for ConnectionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.pubsub_port, self.pipeline_port)
    }
}

/// Cluster-wide identity of a peer, `serverName/host/pubsubPort/pipelinePort` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerKey {
    server_name: String,
    addr: ConnectionAddr,
}

impl PeerKey {
    pub fn compute(server_name: &str, addr: &ConnectionAddr) -> Self {
        Self {
            server_name: server_name.to_string(),
            addr: addr.clone(),
        }
    }

    /// Decode a hash string. The server name may itself contain `/`.
    pub fn parse(hash: &str) -> Result<Self> {
        let invalid = || Error::InvalidPeerKey(hash.to_string());

        let mut parts = hash.rsplitn(4, '/');
        let pipeline_port = parts.next().ok_or_else(invalid)?;
        let pubsub_port = parts.next().ok_or_else(invalid)?;
        let host = parts.next().ok_or_else(invalid)?;
        let server_name = parts.next().ok_or_else(invalid)?;

        if server_name.is_empty() || host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            server_name: server_name.to_string(),
            addr: ConnectionAddr {
                host: host.to_string(),
                pubsub_port: pubsub_port.parse().map_err(|_| invalid())?,
                pipeline_port: pipeline_port.parse().map_err(|_| invalid())?,
            },
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn connection_addr(&self) -> &ConnectionAddr {
        &self.addr
    }

    pub fn to_peer_address(&self) -> PeerAddress {
        self.addr
            .to_peer_address()
            .with_server_name(self.server_name.clone())
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.server_name, self.addr.host, self.addr.pubsub_port, self.addr.pipeline_port
        )
    }
}

impl TryFrom<String> for PeerKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerKey> for String {
    fn from(key: PeerKey) -> Self {
        key.to_string()
    }
}
