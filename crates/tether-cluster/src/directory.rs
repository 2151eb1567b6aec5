//! Peer membership and discovery
//!
//! Handles:
//! - Canonical peer identity (peer hashes) and connection deduplication
//! - Debounced membership announcements that flood the cluster to a full mesh
//! - Peer removal, including telling the rest of the cluster
//! - The resync request that asks every peer to replay its registries

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::types::{
    AddPeers, ClusterMessage, ConnectionAddr, PeerAddress, PeerKey, RemovePeer, RequestState,
};

use crate::error::{ClusterError, ClusterResult};
use crate::events::{EventBus, NodeEvent};
use crate::fabric::{self, PushHandle, SocketFabric};
use crate::timer::Debouncer;

#[derive(Debug, Default)]
struct Membership {
    /// Every peer hash learned so far
    known: HashSet<PeerKey>,
    /// Server name to the connection it is reached over
    names: HashMap<String, ConnectionAddr>,
}

impl Membership {
    fn learn(&mut self, key: &PeerKey) {
        self.known.insert(key.clone());
        self.names
            .insert(key.server_name().to_string(), key.connection_addr().clone());
    }

    /// Forget everything reached over `addr`, returning the forgotten keys
    fn forget(&mut self, addr: &ConnectionAddr) -> Vec<PeerKey> {
        let mut forgotten: Vec<PeerKey> = self
            .known
            .iter()
            .filter(|key| key.connection_addr() == addr)
            .cloned()
            .collect();
        forgotten.sort();

        self.known.retain(|key| key.connection_addr() != addr);
        self.names.retain(|_, reached_over| reached_over != addr);
        forgotten
    }
}

/// An announced peer whose connections are still being opened
struct Connecting {
    server_name: String,
    cancel: CancellationToken,
    done: Shared<BoxFuture<'static, ()>>,
}

/// Tracks the peers of one node and keeps the fabric connected to them
pub struct PeerDirectory {
    server_name: String,
    local_key: PeerKey,
    fabric: Arc<SocketFabric>,
    membership: Mutex<Membership>,
    connecting: Mutex<HashMap<ConnectionAddr, Connecting>>,
    announce: Debouncer,
    resync: Debouncer,
    events: EventBus,
}

impl PeerDirectory {
    pub fn new(
        server_name: impl Into<String>,
        fabric: Arc<SocketFabric>,
        announce_debounce: Duration,
        resync_delay: Duration,
        events: EventBus,
    ) -> Self {
        let server_name = server_name.into();
        let local_key = PeerKey::compute(&server_name, fabric.local_addr());

        Self {
            server_name,
            local_key,
            fabric,
            membership: Mutex::new(Membership::default()),
            connecting: Mutex::new(HashMap::new()),
            announce: Debouncer::new(announce_debounce),
            resync: Debouncer::new(resync_delay),
            events,
        }
    }

    /// This node's own peer hash
    pub fn local_key(&self) -> &PeerKey {
        &self.local_key
    }

    /// Connect to a peer, or return the existing push handle when both
    /// connections to its address are already open.
    ///
    /// The host is resolved first, so `localhost` and `127.0.0.1` name the
    /// same peer. A new connection schedules a membership announcement and a
    /// resync request.
    pub async fn add_peer(self: &Arc<Self>, address: &PeerAddress) -> ClusterResult<PushHandle> {
        let addr = fabric::resolve(&address.connection_addr()).await?;
        if &addr == self.fabric.local_addr() {
            return Err(ClusterError::SelfPeer(address.to_string()));
        }
        let server_name = address.server_name.as_deref();

        if self.fabric.has_both(&addr) {
            if let Some(handle) = self.fabric.push_handle(&addr) {
                self.learn(server_name, &addr);
                return Ok(handle);
            }
        }

        let connected = async {
            self.fabric.connect_broadcast(&addr).await?;
            self.fabric.connect_direct(&addr).await
        }
        .await;

        let handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                self.fabric.disconnect(&addr).await;
                return Err(e);
            }
        };

        self.learn(server_name, &addr);
        info!("Connected to peer {}", address);

        let mut added = addr.to_peer_address();
        added.server_name = address.server_name.clone();
        self.events.emit(NodeEvent::PeerAdded(added));
        metrics::gauge!("tether_cluster_peers").set(self.fabric.connected().len() as f64);

        self.schedule_announce();
        self.schedule_resync();
        Ok(handle)
    }

    /// Disconnect from a peer and tell the cluster every server reached over
    /// its address has left. Returns the departed server names.
    ///
    /// No-op when nothing is known about the address.
    pub async fn remove_peer(&self, address: &PeerAddress) -> ClusterResult<Vec<String>> {
        let literal = address.connection_addr();
        let addr = fabric::resolve(&literal).await.unwrap_or(literal);
        if &addr == self.fabric.local_addr() {
            return Err(ClusterError::SelfPeer(address.to_string()));
        }

        if let Some(connecting) = self.connecting.lock().remove(&addr) {
            debug!("Abandoning connection in progress to {}", addr);
            connecting.cancel.cancel();
        }

        let forgotten = self.membership.lock().forget(&addr);
        if forgotten.is_empty() && !self.fabric.has_any(&addr) {
            debug!("Ignoring removal of unknown peer {}", address);
            return Ok(Vec::new());
        }

        for key in &forgotten {
            self.push_all(ClusterMessage::RemovePeer(RemovePeer { hash: key.clone() }));
        }
        self.fabric.disconnect(&addr).await;

        let departed: Vec<String> = forgotten
            .iter()
            .map(|key| key.server_name().to_string())
            .collect();

        info!("Removed peer {} ({:?})", address, departed);
        let mut removed = address.clone();
        if removed.server_name.is_none() {
            removed.server_name = departed.first().cloned();
        }
        self.events.emit(NodeEvent::PeerRemoved(removed));
        metrics::gauge!("tether_cluster_peers").set(self.fabric.connected().len() as f64);

        Ok(departed)
    }

    /// Connect to every peer a membership announcement names that is not
    /// already known.
    ///
    /// Connections are opened in background tasks, at most one per address,
    /// and failures are reported as error events.
    pub fn handle_add_peers(self: &Arc<Self>, announcement: AddPeers) {
        let AddPeers {
            self_hash,
            known_hashes,
        } = announcement;

        let mut candidates: Vec<PeerKey> = std::iter::once(self_hash)
            .chain(known_hashes)
            .filter(|key| key != &self.local_key)
            .collect();
        candidates.sort();
        candidates.dedup();

        let fresh: Vec<PeerKey> = {
            let membership = self.membership.lock();
            candidates
                .into_iter()
                .filter(|key| !membership.known.contains(key))
                .collect()
        };

        for key in fresh {
            if key.connection_addr() == self.fabric.local_addr() {
                // Our own coordinates under another name
                continue;
            }
            debug!("Learned peer {} from announcement", key);
            self.spawn_add_peer(key);
        }
    }

    /// Wait until no announced connection to `server_name` is in progress
    pub async fn wait_for_peer(&self, server_name: &str) {
        let pending: Vec<Shared<BoxFuture<'static, ()>>> = self
            .connecting
            .lock()
            .values()
            .filter(|connecting| connecting.server_name == server_name)
            .map(|connecting| connecting.done.clone())
            .collect();
        futures::future::join_all(pending).await;
    }

    fn spawn_add_peer(self: &Arc<Self>, key: PeerKey) {
        let addr = key.connection_addr().clone();
        let server_name = key.server_name().to_string();
        let mut connecting = self.connecting.lock();
        if connecting.contains_key(&addr) {
            debug!("Already connecting to {}", addr);
            return;
        }

        let cancel = self.fabric.child_token();
        let task_cancel = cancel.clone();
        let directory = Arc::clone(self);
        let task = self.fabric.spawn(async move {
            let address = key.to_peer_address();
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    debug!("Connection to announced peer {} abandoned", key);
                }
                added = directory.add_peer(&address) => {
                    if let Err(e) = added {
                        directory.events.error(e);
                    }
                }
            }
            // A cancelled attempt was already removed by `remove_peer`
            if !task_cancel.is_cancelled() {
                directory.connecting.lock().remove(key.connection_addr());
            }
        });

        connecting.insert(
            addr,
            Connecting {
                server_name,
                cancel,
                done: task.map(|_| ()).boxed().shared(),
            },
        );
    }

    /// Push handle for a server, if its name is known and connected
    pub fn push_handle(&self, server_name: &str) -> Option<PushHandle> {
        let addr = self.membership.lock().names.get(server_name).cloned()?;
        self.fabric.push_handle(&addr)
    }

    /// Every connected peer, with its server name when known
    pub fn peers(&self) -> Vec<PeerAddress> {
        let names: Vec<(String, ConnectionAddr)> = self
            .membership
            .lock()
            .names
            .iter()
            .map(|(name, addr)| (name.clone(), addr.clone()))
            .collect();

        let mut peers = Vec::new();
        for addr in self.fabric.connected() {
            let mut named: Vec<&String> = names
                .iter()
                .filter(|(_, reached_over)| reached_over == &addr)
                .map(|(name, _)| name)
                .collect();
            named.sort();

            if named.is_empty() {
                peers.push(addr.to_peer_address());
            } else {
                peers.extend(
                    named
                        .into_iter()
                        .map(|name| addr.to_peer_address().with_server_name(name.clone())),
                );
            }
        }
        peers
    }

    /// Every peer hash learned so far, sorted
    pub fn known_keys(&self) -> Vec<PeerKey> {
        let mut keys: Vec<PeerKey> = self.membership.lock().known.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// (Re)start the resync countdown
    pub fn schedule_resync(self: &Arc<Self>) {
        let directory = Arc::downgrade(self);
        self.resync.schedule(move || {
            with_directory(&directory, |directory| {
                debug!("Requesting cluster state");
                directory.push_all(ClusterMessage::RequestState(RequestState {
                    server_name: directory.server_name.clone(),
                }));
            })
        });
    }

    /// Tell every peer this node is leaving. Returns the number of peers
    /// the notice was queued for.
    pub fn announce_departure(&self) -> usize {
        self.push_all(ClusterMessage::RemovePeer(RemovePeer {
            hash: self.local_key.clone(),
        }))
    }

    pub fn cancel_timers(&self) {
        self.announce.cancel();
        self.resync.cancel();
    }

    fn schedule_announce(self: &Arc<Self>) {
        let directory = Arc::downgrade(self);
        self.announce.schedule(move || {
            with_directory(&directory, |directory| {
                let announcement = AddPeers {
                    self_hash: directory.local_key.clone(),
                    known_hashes: directory.known_keys(),
                };
                debug!(
                    "Announcing {} known peers",
                    announcement.known_hashes.len()
                );
                directory.push_all(ClusterMessage::AddPeers(announcement));
            })
        });
    }

    fn learn(&self, server_name: Option<&str>, addr: &ConnectionAddr) {
        if let Some(server_name) = server_name {
            self.membership
                .lock()
                .learn(&PeerKey::compute(server_name, addr));
        }
    }

    /// Membership traffic goes over the direct connections, which exist
    /// before the peer has subscribed to this node's broadcasts.
    fn push_all(&self, message: ClusterMessage) -> usize {
        let frame = match message
            .to_envelope(&self.server_name)
            .and_then(|envelope| envelope.encode())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.topic(), e);
                return 0;
            }
        };

        let sent = self.fabric.push_all(frame);
        metrics::counter!("tether_messages_sent_total", "channel" => "cluster")
            .increment(sent as u64);
        sent
    }
}

fn with_directory(directory: &Weak<PeerDirectory>, action: impl FnOnce(&PeerDirectory)) {
    if let Some(directory) = directory.upgrade() {
        action(&directory);
    }
}

impl std::fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("local_key", &self.local_key)
            .field("known", &self.membership.lock().known.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tether_core::types::Envelope;
    use tokio::sync::mpsc;

    const DEBOUNCE: Duration = Duration::from_millis(10);
    const RESYNC: Duration = Duration::from_millis(50);

    async fn directory(name: &str) -> (Arc<PeerDirectory>, mpsc::Receiver<Bytes>) {
        directory_with_debounce(name, DEBOUNCE).await
    }

    async fn directory_with_debounce(
        name: &str,
        debounce: Duration,
    ) -> (Arc<PeerDirectory>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let events = EventBus::new(16);
        let bind = PeerAddress::new("127.0.0.1").with_ports(0, 0);
        let fabric = Arc::new(SocketFabric::bind(&bind, tx, events.clone()).await.unwrap());
        let directory = PeerDirectory::new(name, fabric, debounce, RESYNC, events);
        (Arc::new(directory), rx)
    }

    /// Every cluster message received until the line goes quiet
    async fn drain_messages(rx: &mut mpsc::Receiver<Bytes>, quiet: Duration) -> Vec<ClusterMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(quiet, rx.recv()).await {
            let envelope = Envelope::decode(&frame).unwrap();
            if let Some(Ok(message)) = ClusterMessage::from_parts(&envelope.topic, envelope.payload) {
                messages.push(message);
            }
        }
        messages
    }

    async fn next_message(rx: &mut mpsc::Receiver<Bytes>) -> ClusterMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        let envelope = Envelope::decode(&frame).unwrap();
        ClusterMessage::from_parts(&envelope.topic, envelope.payload)
            .unwrap()
            .unwrap()
    }

    fn address_of(directory: &PeerDirectory) -> PeerAddress {
        directory.fabric.local_addr().to_peer_address()
    }

    #[tokio::test]
    async fn test_add_peer_is_deduplicated() {
        let (a, _rx_a) = directory("node-A").await;
        let (b, _rx_b) = directory("node-B").await;

        let first = a.add_peer(&address_of(&b)).await.unwrap();
        let second = a.add_peer(&address_of(&b)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(a.peers(), vec![address_of(&b)]);

        a.fabric.close().await;
        b.fabric.close().await;
    }

    #[tokio::test]
    async fn test_add_self_is_rejected() {
        let (a, _rx) = directory("node-A").await;
        let result = a.add_peer(&address_of(&a)).await;
        assert!(matches!(result, Err(ClusterError::SelfPeer(_))));
        a.fabric.close().await;
    }

    #[tokio::test]
    async fn test_announce_then_resync_request() {
        let (a, _rx_a) = directory("node-A").await;
        let (b, mut rx_b) = directory("node-B").await;

        a.add_peer(&address_of(&b)).await.unwrap();

        match next_message(&mut rx_b).await {
            ClusterMessage::AddPeers(announcement) => {
                assert_eq!(&announcement.self_hash, a.local_key());
                assert!(announcement.known_hashes.is_empty());
            }
            other => panic!("Expected announcement, got {:?}", other),
        }
        assert_eq!(
            next_message(&mut rx_b).await,
            ClusterMessage::RequestState(RequestState {
                server_name: "node-A".to_string()
            })
        );

        a.fabric.close().await;
        b.fabric.close().await;
    }

    #[tokio::test]
    async fn test_handle_add_peers_learns_names() {
        let (a, _rx_a) = directory("node-A").await;
        let (b, _rx_b) = directory("node-B").await;

        a.add_peer(&address_of(&b)).await.unwrap();
        assert!(a.push_handle("node-B").is_none());

        a.handle_add_peers(AddPeers {
            self_hash: b.local_key().clone(),
            known_hashes: vec![a.local_key().clone()],
        });
        a.wait_for_peer("node-B").await;

        assert!(a.push_handle("node-B").is_some());
        assert_eq!(a.known_keys(), vec![b.local_key().clone()]);
        assert_eq!(
            a.peers(),
            vec![address_of(&b).with_server_name("node-B")]
        );

        a.fabric.close().await;
        b.fabric.close().await;
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let (a, _rx_a) = directory("node-A").await;
        let (b, _rx_b) = directory("node-B").await;
        let named_b = address_of(&b).with_server_name("node-B");

        a.add_peer(&named_b).await.unwrap();
        let departed = a.remove_peer(&address_of(&b)).await.unwrap();

        assert_eq!(departed, vec!["node-B".to_string()]);
        assert!(a.peers().is_empty());
        assert!(a.push_handle("node-B").is_none());
        assert!(a.remove_peer(&address_of(&b)).await.unwrap().is_empty());

        a.fabric.close().await;
        b.fabric.close().await;
    }

    #[tokio::test]
    async fn test_burst_of_adds_is_announced_once() {
        let (a, _rx_a) = directory_with_debounce("node-A", Duration::from_millis(200)).await;
        let (b, mut rx_b) = directory("node-B").await;
        let mut others = Vec::new();
        for name in ["node-C", "node-D", "node-E"] {
            others.push(directory(name).await);
        }

        a.add_peer(&address_of(&b).with_server_name("node-B"))
            .await
            .unwrap();
        for (other, _) in &others {
            let name = other.local_key().server_name().to_string();
            a.add_peer(&address_of(other).with_server_name(name))
                .await
                .unwrap();
        }

        let announcements: Vec<AddPeers> = drain_messages(&mut rx_b, Duration::from_millis(500))
            .await
            .into_iter()
            .filter_map(|message| match message {
                ClusterMessage::AddPeers(announcement) => Some(announcement),
                _ => None,
            })
            .collect();

        assert_eq!(announcements.len(), 1);
        assert_eq!(&announcements[0].self_hash, a.local_key());
        assert_eq!(announcements[0].known_hashes.len(), 4);

        a.fabric.close().await;
        b.fabric.close().await;
        for (other, _) in others {
            other.fabric.close().await;
        }
    }

    #[tokio::test]
    async fn test_host_name_and_ip_are_one_peer() {
        let (a, _rx_a) = directory("node-A").await;
        let (b, _rx_b) = directory("node-B").await;
        let by_ip = address_of(&b);
        let by_name = PeerAddress::new("localhost").with_ports(by_ip.pubsub_port, by_ip.pipeline_port);

        let first = a.add_peer(&by_name).await.unwrap();
        let second = a.add_peer(&by_ip.clone().with_server_name("node-B")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(a.peers(), vec![by_ip.with_server_name("node-B")]);

        a.fabric.close().await;
        b.fabric.close().await;
    }

    #[tokio::test]
    async fn test_announcement_does_not_wait_for_connect() {
        let (a, _rx_a) = directory("node-A").await;
        // TEST-NET-1, never answers
        let silent = PeerKey::parse("ghost/192.0.2.1/6021/6022").unwrap();

        let announcement = AddPeers {
            self_hash: silent.clone(),
            known_hashes: vec![silent.clone()],
        };
        a.handle_add_peers(announcement.clone());
        a.handle_add_peers(announcement);

        assert_eq!(a.connecting.lock().len(), 1);
        assert!(a.known_keys().is_empty());

        // Removal abandons the attempt
        a.remove_peer(&silent.to_peer_address()).await.unwrap();
        assert!(a.connecting.lock().is_empty());
        a.wait_for_peer("ghost").await;

        a.fabric.close().await;
    }
}
