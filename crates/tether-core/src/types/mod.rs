//! Core types for Tether

mod cluster;
mod message;
mod peer;

pub use cluster::*;
pub use message::*;
pub use peer::*;
