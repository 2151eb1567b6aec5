//! Lifecycle and membership notifications emitted by a node

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use tether_core::types::PeerAddress;

use crate::error::ClusterError;

/// Notifications a [`ClusterNode`](crate::ClusterNode) emits
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Both local sockets are bound
    Ready,
    /// Non-fatal transport fault
    Error(Arc<ClusterError>),
    /// Teardown finished
    Close,
    /// Connections to a peer were opened
    PeerAdded(PeerAddress),
    /// Connections to a peer were closed
    PeerRemoved(PeerAddress),
}

/// Fan-out sender shared by every component of a node
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: NodeEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Report a non-fatal error
    pub fn error(&self, error: ClusterError) {
        warn!("Cluster error: {}", error);
        self.emit(NodeEvent::Error(Arc::new(error)));
    }
}
