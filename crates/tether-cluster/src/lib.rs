//! Tether Cluster - peer messaging and replicated name registries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ClusterNode                           │
//! │  lifecycle · protocol dispatch · registry claims            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │ PeerDirectory │  │ MessageRouter │  │ StateRegistry │   │
//! │  │               │  │               │  │  (per topic)  │   │
//! │  │ - Peer hashes │  │ - Envelopes   │  │ - name→owners │   │
//! │  │ - Announces   │  │ - Subscribers │  │ - Local claims│   │
//! │  │ - Resync      │  │ - Direct send │  │ - Purge       │   │
//! │  └───────┬───────┘  └───────┬───────┘  └───────────────┘   │
//! │          │                  │                               │
//! │          └────────┬─────────┘                               │
//! │                   │                                         │
//! │          ┌────────┴────────┐                                │
//! │          │  SocketFabric   │  publish · pull                │
//! │          │  (TCP, framed)  │  subscribe · push per peer     │
//! │          └─────────────────┘                                │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Gossip Discovery**: One seed is enough; announcements flood to a full mesh
//! - **Broadcast and Direct Messaging**: Best effort, ordered per connection
//! - **Replicated Registries**: Converge through claims, purges and resync
//! - **Graceful Leave**: Peers are told before the sockets close

mod directory;
mod error;
mod events;
mod fabric;
mod node;
mod registry;
mod router;
mod timer;

pub use directory::PeerDirectory;
pub use error::{ClusterError, ClusterResult};
pub use events::{EventBus, NodeEvent};
pub use fabric::{PushHandle, SocketFabric, SubscribeHandle};
pub use node::{ClusterNode, ClusterNodeBuilder, NodeState};
pub use registry::{ClaimChange, ClusterClaim, RegistryEvent, StateRegistry};
pub use router::{Inbound, MessageRouter};
pub use timer::Debouncer;

// Re-export types from core
pub use tether_core::types::{
    ClusterConfig, ClusterMessage, ConnectionAddr, Envelope, PeerAddress, PeerKey,
};
