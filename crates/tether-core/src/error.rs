//! Error types for Tether core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid peer address: {0}")]
    InvalidPeerAddress(String),

    #[error("Invalid peer hash: {0}")]
    InvalidPeerKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config: {0}")]
    ConfigRead(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
