//! Tether Core Library
//!
//! Core types, wire format and configuration shared by the Tether cluster
//! crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::TetherConfig;
pub use error::{Error, Result};

/// Tether version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port of the broadcast (publish/subscribe) socket
pub const DEFAULT_PUBSUB_PORT: u16 = 6021;

/// Default port of the direct (push/pull) socket
pub const DEFAULT_PIPELINE_PORT: u16 = 6022;

/// Default coalescing window for membership announcements (ms)
pub const DEFAULT_ANNOUNCE_DEBOUNCE_MS: u64 = 10;

/// Default delay before a state resync request is sent (ms)
pub const DEFAULT_RESYNC_DELAY_MS: u64 = 100;

/// Default settle delay before sockets are torn down on close (ms)
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 100;

/// Default capacity of the inbound frame channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
