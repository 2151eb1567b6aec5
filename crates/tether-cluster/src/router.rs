//! Envelope encoding and topic dispatch

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use tether_core::types::{is_reserved_topic, ClusterMessage, Envelope};

use crate::directory::PeerDirectory;
use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;
use crate::fabric::SocketFabric;

type Callback = Arc<dyn Fn(&Value, &str) + Send + Sync>;

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Cluster {
        message: ClusterMessage,
        origin: String,
    },
    Application(Envelope),
}

/// Sends envelopes over the fabric and hands received ones to subscribers
pub struct MessageRouter {
    server_name: String,
    fabric: Arc<SocketFabric>,
    directory: Arc<PeerDirectory>,
    subscribers: RwLock<HashMap<String, Vec<Callback>>>,
    events: EventBus,
}

impl MessageRouter {
    pub fn new(
        server_name: impl Into<String>,
        fabric: Arc<SocketFabric>,
        directory: Arc<PeerDirectory>,
        events: EventBus,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            fabric,
            directory,
            subscribers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Broadcast to every subscribed peer. Best effort, never acknowledged.
    pub fn send(&self, topic: &str, payload: Value) {
        if is_reserved_topic(topic) {
            self.events
                .error(ClusterError::ReservedTopic(topic.to_string()));
            return;
        }

        let envelope = Envelope::new(topic, payload, self.server_name.clone());
        if let Some(frame) = self.encode(&envelope) {
            let subscribers = self.fabric.publish(frame);
            trace!("Published '{}' to {} subscribers", topic, subscribers);
            metrics::counter!("tether_messages_sent_total", "channel" => "broadcast")
                .increment(1);
        }
    }

    /// Send to one server. Dropped with an error event if the server is not
    /// connected.
    pub fn send_direct(&self, target: &str, topic: &str, payload: Value) {
        if is_reserved_topic(topic) {
            self.events
                .error(ClusterError::ReservedTopic(topic.to_string()));
            return;
        }

        let envelope = Envelope::new(topic, payload, self.server_name.clone());
        if let Err(e) = self.push(target, &envelope) {
            self.events.error(e);
        }
    }

    /// Send a cluster protocol message to every connected peer.
    ///
    /// Cluster traffic uses the direct connections so it reaches peers that
    /// have not subscribed to this node yet.
    pub fn broadcast_cluster(&self, message: &ClusterMessage) {
        let frame = match message.to_envelope(&self.server_name) {
            Ok(envelope) => self.encode(&envelope),
            Err(e) => {
                self.events.error(e.into());
                None
            }
        };
        if let Some(frame) = frame {
            let sent = self.fabric.push_all(frame);
            trace!("Pushed {} to {} peers", message.topic(), sent);
            metrics::counter!("tether_messages_sent_total", "channel" => "cluster")
                .increment(sent as u64);
        }
    }

    /// Send a cluster protocol message to one server
    pub fn send_cluster_direct(&self, target: &str, message: &ClusterMessage) -> ClusterResult<()> {
        let envelope = message.to_envelope(&self.server_name)?;
        self.push(target, &envelope)
    }

    /// Register `callback` for `topic`. Callbacks run in registration order.
    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Decode a frame. Malformed frames and this node's own frames yield `None`.
    pub fn decode(&self, frame: &[u8]) -> Option<Inbound> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Discarding malformed frame: {}", e);
                metrics::counter!("tether_messages_dropped_total", "reason" => "malformed")
                    .increment(1);
                return None;
            }
        };

        if envelope.origin == self.server_name {
            metrics::counter!("tether_messages_dropped_total", "reason" => "own")
                .increment(1);
            return None;
        }

        match ClusterMessage::from_parts(&envelope.topic, envelope.payload.clone()) {
            None => Some(Inbound::Application(envelope)),
            Some(Ok(message)) => Some(Inbound::Cluster {
                message,
                origin: envelope.origin,
            }),
            Some(Err(e)) => {
                debug!(
                    "Discarding malformed {} from {}: {}",
                    envelope.topic, envelope.origin, e
                );
                metrics::counter!("tether_messages_dropped_total", "reason" => "malformed")
                    .increment(1);
                None
            }
        }
    }

    /// Hand an application envelope to the topic's subscribers
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let callbacks: Vec<Callback> = match self.subscribers.read().get(&envelope.topic) {
            Some(callbacks) => callbacks.clone(),
            None => {
                trace!("No subscribers for '{}'", envelope.topic);
                return 0;
            }
        };

        for callback in &callbacks {
            callback(&envelope.payload, &envelope.origin);
        }
        callbacks.len()
    }

    fn push(&self, target: &str, envelope: &Envelope) -> ClusterResult<()> {
        let handle = self
            .directory
            .push_handle(target)
            .ok_or_else(|| ClusterError::UnknownPeer(target.to_string()))?;

        let frame = envelope.encode()?;
        handle.send(frame)?;
        metrics::counter!("tether_messages_sent_total", "channel" => "direct").increment(1);
        Ok(())
    }

    fn encode(&self, envelope: &Envelope) -> Option<Bytes> {
        match envelope.encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.events.error(e.into());
                None
            }
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("server_name", &self.server_name)
            .field("topics", &self.subscribers.read().len())
            .finish()
    }
}
