//! Cluster node - the coordinator of one member of the cluster
//!
//! Responsibilities:
//! - Bind the socket fabric and wire it to the directory and router
//! - Dispatch the cluster protocol messages
//! - Own the per-topic state registries and broadcast their local claims
//! - Drive the node lifecycle from creation to close

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tether_core::types::{
    ClusterConfig, ClusterMessage, PeerAddress, RemovePeer, RequestState, StateSnapshot,
    TopicChange,
};

use crate::directory::PeerDirectory;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{EventBus, NodeEvent};
use crate::fabric::{PushHandle, SocketFabric};
use crate::registry::{ClaimChange, ClusterClaim, StateRegistry};
use crate::router::{Inbound, MessageRouter};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a node. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Binding,
    Ready,
    Closing,
    Closed,
}

/// Components that exist once the sockets are bound
struct Wiring {
    fabric: Arc<SocketFabric>,
    directory: Arc<PeerDirectory>,
    router: Arc<MessageRouter>,
}

type PendingSubscription = Box<dyn FnOnce(&MessageRouter) + Send>;

struct NodeInner {
    config: ClusterConfig,
    state: RwLock<NodeState>,
    events: EventBus,
    wiring: OnceLock<Wiring>,
    /// Subscriptions made before start
    pending: Mutex<Vec<PendingSubscription>>,
    registries: RwLock<HashMap<String, Arc<StateRegistry>>>,
    claims_tx: mpsc::UnboundedSender<ClusterClaim>,
    claims_rx: Mutex<Option<mpsc::UnboundedReceiver<ClusterClaim>>>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// One member of the cluster
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct ClusterNode {
    inner: Arc<NodeInner>,
}

impl ClusterNode {
    /// Create a node in the `Created` state. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(config: ClusterConfig) -> Self {
        let (claims_tx, claims_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(NodeInner {
                config,
                state: RwLock::new(NodeState::Created),
                events: EventBus::new(EVENT_CAPACITY),
                wiring: OnceLock::new(),
                pending: Mutex::new(Vec::new()),
                registries: RwLock::new(HashMap::new()),
                claims_tx,
                claims_rx: Mutex::new(Some(claims_rx)),
                shutdown: CancellationToken::new(),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn builder() -> ClusterNodeBuilder {
        ClusterNodeBuilder::new()
    }

    /// Bind both sockets, connect the configured peers and become `Ready`.
    ///
    /// A bind failure or an unreachable configured peer fails the start and
    /// leaves the node `Closed`.
    pub async fn start(&self) -> ClusterResult<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                NodeState::Created => *state = NodeState::Binding,
                NodeState::Closing | NodeState::Closed => return Err(ClusterError::AlreadyClosed),
                NodeState::Binding | NodeState::Ready => return Err(ClusterError::AlreadyStarted),
            }
        }

        if let Err(e) = self.inner.bring_up().await {
            error!(
                "Failed to start cluster node '{}': {}",
                self.inner.config.server_name, e
            );
            self.inner.tear_down().await;
            *self.inner.state.write() = NodeState::Closed;
            return Err(e);
        }

        *self.inner.state.write() = NodeState::Ready;
        self.inner.events.emit(NodeEvent::Ready);

        if let Some(wiring) = self.inner.wiring.get() {
            info!(
                "Cluster node '{}' ready on {}",
                self.inner.config.server_name,
                wiring.fabric.local_addr()
            );
            wiring.directory.schedule_resync();
        }
        Ok(())
    }

    /// Broadcast `payload` on `topic` to every peer
    pub fn send(&self, topic: &str, payload: Value) -> ClusterResult<()> {
        self.inner.ready()?.router.send(topic, payload);
        Ok(())
    }

    /// Send `payload` on `topic` to one server. An unknown server is reported
    /// as an error event and the message is dropped.
    pub fn send_direct(&self, server_name: &str, topic: &str, payload: Value) -> ClusterResult<()> {
        self.inner
            .ready()?
            .router
            .send_direct(server_name, topic, payload);
        Ok(())
    }

    /// Receive every message on `topic` as `(payload, origin server name)`
    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        let mut pending = self.inner.pending.lock();
        match self.inner.wiring.get() {
            Some(wiring) => {
                drop(pending);
                wiring.router.subscribe(topic, callback);
            }
            None => {
                let topic = topic.to_string();
                pending.push(Box::new(move |router: &MessageRouter| {
                    router.subscribe(&topic, callback)
                }));
            }
        }
    }

    /// The registry for `topic`, created on first use
    pub fn state_registry(&self, topic: &str) -> Arc<StateRegistry> {
        self.inner.state_registry(topic)
    }

    pub async fn add_peer(&self, address: &PeerAddress) -> ClusterResult<PushHandle> {
        self.inner.ready()?.directory.add_peer(address).await
    }

    /// Disconnect from a peer and purge every server reached over its address
    /// from all registries.
    pub async fn remove_peer(&self, address: &PeerAddress) -> ClusterResult<()> {
        let wiring = self.inner.ready()?;
        self.inner.remove_peer(wiring, address).await?;
        Ok(())
    }

    /// Connected peers, with server names where known
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.inner
            .wiring
            .get()
            .map(|wiring| wiring.directory.peers())
            .unwrap_or_default()
    }

    /// Lifecycle and membership notifications
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn server_name(&self) -> &str {
        &self.inner.config.server_name
    }

    /// The bound address, once started
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.inner.wiring.get().map(|wiring| {
            wiring
                .fabric
                .local_addr()
                .to_peer_address()
                .with_server_name(self.inner.config.server_name.clone())
        })
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    /// Leave the cluster and release every socket.
    ///
    /// Peers are told this node is leaving, then after the settle delay all
    /// connections and both bound sockets are closed. Resolves once every one
    /// of them has closed. Fails with `AlreadyClosed` if the node is already
    /// closing or closed, and with `NotReady` while [`start`](Self::start) is
    /// still binding; a failed start closes the node itself.
    pub async fn close(&self) -> ClusterResult<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                NodeState::Closing | NodeState::Closed => return Err(ClusterError::AlreadyClosed),
                NodeState::Binding => return Err(ClusterError::NotReady),
                NodeState::Created => {
                    *state = NodeState::Closed;
                    drop(state);
                    self.inner.events.emit(NodeEvent::Close);
                    return Ok(());
                }
                NodeState::Ready => *state = NodeState::Closing,
            }
        }

        info!("Closing cluster node '{}'", self.inner.config.server_name);

        if let Some(wiring) = self.inner.wiring.get() {
            wiring.directory.cancel_timers();
            wiring.fabric.stop_inbound();

            let notified = wiring.directory.announce_departure();
            debug!("Departure announced to {} peers", notified);

            tokio::time::sleep(self.inner.config.settle_delay).await;
        }
        self.inner.tear_down().await;

        *self.inner.state.write() = NodeState::Closed;
        self.inner.events.emit(NodeEvent::Close);
        info!("Cluster node '{}' closed", self.inner.config.server_name);
        Ok(())
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("server_name", &self.inner.config.server_name)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeInner {
    fn ready(&self) -> ClusterResult<&Wiring> {
        match *self.state.read() {
            NodeState::Ready => self.wiring.get().ok_or(ClusterError::NotReady),
            NodeState::Closing | NodeState::Closed => Err(ClusterError::AlreadyClosed),
            NodeState::Created | NodeState::Binding => Err(ClusterError::NotReady),
        }
    }

    async fn bring_up(self: &Arc<Self>) -> ClusterResult<()> {
        self.config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.channel_capacity);
        let fabric = Arc::new(
            SocketFabric::bind(&self.config.bind, inbound_tx, self.events.clone()).await?,
        );
        let directory = Arc::new(PeerDirectory::new(
            self.config.server_name.clone(),
            Arc::clone(&fabric),
            self.config.announce_debounce,
            self.config.resync_delay,
            self.events.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            self.config.server_name.clone(),
            Arc::clone(&fabric),
            Arc::clone(&directory),
            self.events.clone(),
        ));

        {
            let mut pending = self.pending.lock();
            for subscription in pending.drain(..) {
                subscription(&router);
            }
            self.wiring
                .set(Wiring {
                    fabric,
                    directory,
                    router,
                })
                .map_err(|_| ClusterError::AlreadyStarted)?;
        }

        let claims_rx = self
            .claims_rx
            .lock()
            .take()
            .ok_or(ClusterError::AlreadyStarted)?;

        {
            let mut loops = self.loops.lock();
            loops.push(tokio::spawn(dispatch_loop(
                Arc::downgrade(self),
                inbound_rx,
                self.shutdown.clone(),
            )));
            loops.push(tokio::spawn(claims_loop(
                Arc::downgrade(self),
                claims_rx,
                self.shutdown.clone(),
            )));
        }

        let wiring = self.wiring.get().ok_or(ClusterError::NotReady)?;
        for peer in &self.config.peers {
            wiring.directory.add_peer(peer).await?;
        }
        Ok(())
    }

    /// Close the fabric and stop both loops
    async fn tear_down(&self) {
        if let Some(wiring) = self.wiring.get() {
            wiring.directory.cancel_timers();
            wiring.fabric.close().await;
        }
        self.shutdown.cancel();

        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        futures::future::join_all(loops).await;
    }

    fn state_registry(&self, topic: &str) -> Arc<StateRegistry> {
        if let Some(registry) = self.registries.read().get(topic) {
            return Arc::clone(registry);
        }

        let mut registries = self.registries.write();
        let registry = registries.entry(topic.to_string()).or_insert_with(|| {
            debug!("Creating state registry '{}'", topic);
            Arc::new(StateRegistry::new(
                topic,
                self.config.server_name.clone(),
                self.claims_tx.clone(),
            ))
        });
        Arc::clone(registry)
    }

    fn registries(&self) -> Vec<Arc<StateRegistry>> {
        self.registries.read().values().cloned().collect()
    }

    async fn remove_peer(&self, wiring: &Wiring, address: &PeerAddress) -> ClusterResult<Vec<String>> {
        let departed = wiring.directory.remove_peer(address).await?;
        for server_name in &departed {
            for registry in self.registries() {
                registry.remove_all(server_name);
            }
        }
        Ok(departed)
    }

    async fn dispatch(self: &Arc<Self>, frame: &Bytes) {
        let Some(wiring) = self.wiring.get() else {
            return;
        };
        let Some(inbound) = wiring.router.decode(frame) else {
            return;
        };

        match inbound {
            Inbound::Application(envelope) => {
                wiring.router.deliver(&envelope);
            }
            Inbound::Cluster { message, origin } => {
                debug!("Received {} from {}", message.topic(), origin);
                self.handle_cluster_message(wiring, message).await;
            }
        }
    }

    async fn handle_cluster_message(self: &Arc<Self>, wiring: &Wiring, message: ClusterMessage) {
        match message {
            ClusterMessage::AddPeers(announcement) => {
                wiring.directory.handle_add_peers(announcement);
            }
            ClusterMessage::RemovePeer(RemovePeer { hash }) => {
                if &hash == wiring.directory.local_key() {
                    debug!("Ignoring removal of this node");
                    return;
                }
                if let Err(e) = self.remove_peer(wiring, &hash.to_peer_address()).await {
                    self.events.error(e);
                }
            }
            ClusterMessage::TopicAdd(change) => {
                if self.is_remote(&change.server_name) {
                    self.state_registry(&change.topic)
                        .add_remote(&change.name, &change.server_name);
                }
            }
            ClusterMessage::TopicRemove(change) => {
                if self.is_remote(&change.server_name) {
                    self.state_registry(&change.topic)
                        .remove_remote(&change.name, &change.server_name);
                }
            }
            ClusterMessage::RequestState(RequestState { server_name }) => {
                if wiring.directory.push_handle(&server_name).is_some() {
                    self.send_state(wiring, &server_name);
                    return;
                }

                // The requester may still be connecting after its announcement
                let node = Arc::downgrade(self);
                let directory = Arc::clone(&wiring.directory);
                wiring.fabric.spawn(async move {
                    directory.wait_for_peer(&server_name).await;
                    if let Some(node) = node.upgrade() {
                        if let Some(wiring) = node.wiring.get() {
                            node.send_state(wiring, &server_name);
                        }
                    }
                });
            }
            ClusterMessage::State(snapshot) => {
                let registry = self.state_registry(&snapshot.topic);
                for server_name in &snapshot.server_names {
                    if self.is_remote(server_name) {
                        registry.add_remote(&snapshot.name, server_name);
                    }
                }
            }
        }
    }

    /// Claims naming this node are only ever made locally
    fn is_remote(&self, server_name: &str) -> bool {
        server_name != self.config.server_name
    }

    /// Replay every registry entry to `target`, one message per name
    fn send_state(&self, wiring: &Wiring, target: &str) {
        let mut sent = 0usize;
        for registry in self.registries() {
            for (name, servers) in registry.get_all_map() {
                let mut server_names: Vec<String> = servers.into_iter().collect();
                server_names.sort();

                let snapshot = ClusterMessage::State(StateSnapshot {
                    topic: registry.topic().to_string(),
                    name,
                    server_names,
                });
                if let Err(e) = wiring.router.send_cluster_direct(target, &snapshot) {
                    self.events.error(e);
                    return;
                }
                sent += 1;
            }
        }
        debug!("Sent {} state entries to {}", sent, target);
    }

    fn broadcast_claim(&self, claim: ClusterClaim) {
        let Some(wiring) = self.wiring.get() else {
            return;
        };

        let change = TopicChange {
            server_name: self.config.server_name.clone(),
            topic: claim.topic,
            name: claim.name,
        };
        let message = match claim.change {
            ClaimChange::Add => ClusterMessage::TopicAdd(change),
            ClaimChange::Remove => ClusterMessage::TopicRemove(change),
        };
        wiring.router.broadcast_cluster(&message);
    }
}

async fn dispatch_loop(
    node: Weak<NodeInner>,
    mut inbound: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(node) = node.upgrade() else {
            break;
        };
        node.dispatch(&frame).await;
    }
    debug!("Dispatch loop stopped");
}

async fn claims_loop(
    node: Weak<NodeInner>,
    mut claims: mpsc::UnboundedReceiver<ClusterClaim>,
    shutdown: CancellationToken,
) {
    loop {
        let claim = tokio::select! {
            _ = shutdown.cancelled() => break,
            claim = claims.recv() => match claim {
                Some(claim) => claim,
                None => break,
            },
        };
        let Some(node) = node.upgrade() else {
            break;
        };
        node.broadcast_claim(claim);
    }
}

/// Builder for ClusterNode
pub struct ClusterNodeBuilder {
    config: ClusterConfig,
}

impl ClusterNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Local address both sockets bind on
    pub fn bind(mut self, address: PeerAddress) -> Self {
        self.config.bind = address;
        self
    }

    /// Add a peer to connect to on start
    pub fn peer(mut self, address: PeerAddress) -> Self {
        self.config.peers.push(address);
        self
    }

    pub fn peers(mut self, addresses: Vec<PeerAddress>) -> Self {
        self.config.peers = addresses;
        self
    }

    pub fn announce_debounce(mut self, delay: Duration) -> Self {
        self.config.announce_debounce = delay;
        self
    }

    pub fn resync_delay(mut self, delay: Duration) -> Self {
        self.config.resync_delay = delay;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn build(self) -> ClusterNode {
        ClusterNode::new(self.config)
    }

    /// Build and start the node
    pub async fn start(self) -> ClusterResult<ClusterNode> {
        let node = self.build();
        node.start().await?;
        Ok(node)
    }
}

impl Default for ClusterNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
