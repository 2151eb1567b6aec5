//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Cannot add the local node as a peer: {0}")]
    SelfPeer(String),

    #[error("Topic is reserved for cluster traffic: {0}")]
    ReservedTopic(String),

    #[error("ClusterNode already closed")]
    AlreadyClosed,

    #[error("ClusterNode already started")]
    AlreadyStarted,

    #[error("ClusterNode is not ready")]
    NotReady,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Core(#[from] tether_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
