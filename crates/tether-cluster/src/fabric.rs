//! Socket fabric: the node's bound sockets and its per-peer connections
//!
//! Two listeners are bound per node:
//! - the **publish** socket, which fans every broadcast frame out to all
//!   connected subscribers
//! - the **pull** socket, which accepts direct frames pushed by peers
//!
//! For every peer the fabric opens one **subscribe** connection (to the peer's
//! publish socket) and one **push** connection (to the peer's pull socket),
//! both keyed by the peer's [`ConnectionAddr`]. Frames are length-delimited.
//! A subscriber opens its connection with one handshake frame carrying its own
//! connection address, so a publisher can later drop it.
//!
//! Connection addresses are keyed by IP literal: host names are resolved
//! before connecting, so one peer reached under two names is one peer.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use tether_core::types::{ConnectionAddr, PeerAddress};

use crate::error::{ClusterError, ClusterResult};
use crate::events::EventBus;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending side of a direct connection to one peer
#[derive(Debug, Clone)]
pub struct PushHandle {
    id: u64,
    addr: ConnectionAddr,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PushHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &ConnectionAddr {
        &self.addr
    }

    /// Queue a frame; fails once the connection is gone.
    pub fn send(&self, frame: Bytes) -> ClusterResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| ClusterError::ConnectionClosed(self.addr.pipeline_endpoint()))
    }
}

impl PartialEq for PushHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Receiving side of a broadcast subscription to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeHandle {
    id: u64,
    addr: ConnectionAddr,
}

impl SubscribeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &ConnectionAddr {
        &self.addr
    }
}

struct Link {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PushLink {
    handle: PushHandle,
    link: Link,
}

struct Session {
    identity: ConnectionAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

type LinkMap<T> = Arc<Mutex<HashMap<ConnectionAddr, T>>>;
type SessionMap = Arc<Mutex<HashMap<u64, Session>>>;

/// Owns the bound publish/pull sockets and every peer connection
pub struct SocketFabric {
    local: ConnectionAddr,
    identity: Bytes,
    inbound_tx: mpsc::Sender<Bytes>,
    subscriptions: LinkMap<Link>,
    pushes: LinkMap<PushLink>,
    sessions: SessionMap,
    next_id: Arc<AtomicU64>,
    /// Cancels every task
    shutdown: CancellationToken,
    /// Cancels accept loops and readers only
    inbound: CancellationToken,
    tracker: TaskTracker,
    events: EventBus,
}

impl SocketFabric {
    /// Bind both local sockets. Fails if either port is taken.
    ///
    /// Port 0 binds an OS-assigned port; [`local_addr`](Self::local_addr)
    /// reports the actual ports.
    pub async fn bind(
        bind: &PeerAddress,
        inbound_tx: mpsc::Sender<Bytes>,
        events: EventBus,
    ) -> ClusterResult<Self> {
        let pubsub = bind_listener(&bind.host, bind.pubsub_port).await?;
        let pipeline = bind_listener(&bind.host, bind.pipeline_port).await?;

        let bound = pubsub.local_addr()?;
        let local = ConnectionAddr {
            host: bound.ip().to_string(),
            pubsub_port: bound.port(),
            pipeline_port: pipeline.local_addr()?.port(),
        };
        let identity = Bytes::from(serde_json::to_vec(&local).map_err(tether_core::Error::from)?);

        info!(
            "Bound publish socket on {} and pull socket on {}",
            local.pubsub_endpoint(),
            local.pipeline_endpoint()
        );

        let shutdown = CancellationToken::new();
        let inbound = shutdown.child_token();

        let fabric = Self {
            local,
            identity,
            inbound_tx,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pushes: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown,
            inbound,
            tracker: TaskTracker::new(),
            events,
        };

        fabric.spawn_publish_accept(pubsub);
        fabric.spawn_pull_accept(pipeline);

        Ok(fabric)
    }

    /// Connection address of the bound sockets
    pub fn local_addr(&self) -> &ConnectionAddr {
        &self.local
    }

    /// Subscribe to a peer's broadcasts. Idempotent per address.
    pub async fn connect_broadcast(&self, addr: &ConnectionAddr) -> ClusterResult<SubscribeHandle> {
        let (handle, ready) = {
            let mut subscriptions = self.subscriptions.lock();
            if let Some(link) = subscriptions.get(addr) {
                return Ok(SubscribeHandle {
                    id: link.id,
                    addr: addr.clone(),
                });
            }

            let id = self.next_id();
            let cancel = self.inbound.child_token();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(run_subscriber(SubscriberTask {
                id,
                addr: addr.clone(),
                identity: self.identity.clone(),
                inbound_tx: self.inbound_tx.clone(),
                cancel: cancel.clone(),
                ready: ready_tx,
                links: Arc::clone(&self.subscriptions),
                events: self.events.clone(),
            }));
            subscriptions.insert(addr.clone(), Link { id, cancel, task });

            (
                SubscribeHandle {
                    id,
                    addr: addr.clone(),
                },
                ready_rx,
            )
        };

        await_ready(ready, addr.pubsub_endpoint()).await?;
        debug!("Subscribed to broadcasts of {}", addr.pubsub_endpoint());
        Ok(handle)
    }

    /// Open a push connection to a peer. Idempotent per address.
    pub async fn connect_direct(&self, addr: &ConnectionAddr) -> ClusterResult<PushHandle> {
        let (handle, ready) = {
            let mut pushes = self.pushes.lock();
            if let Some(push) = pushes.get(addr) {
                return Ok(push.handle.clone());
            }

            let id = self.next_id();
            let cancel = self.shutdown.child_token();
            let (tx, rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(run_push(PushTask {
                id,
                addr: addr.clone(),
                rx,
                cancel: cancel.clone(),
                ready: ready_tx,
                links: Arc::clone(&self.pushes),
                events: self.events.clone(),
            }));

            let handle = PushHandle {
                id,
                addr: addr.clone(),
                tx,
            };
            pushes.insert(
                addr.clone(),
                PushLink {
                    handle: handle.clone(),
                    link: Link { id, cancel, task },
                },
            );
            (handle, ready_rx)
        };

        await_ready(ready, addr.pipeline_endpoint()).await?;
        debug!("Opened push connection to {}", addr.pipeline_endpoint());
        Ok(handle)
    }

    pub fn has_both(&self, addr: &ConnectionAddr) -> bool {
        self.subscriptions.lock().contains_key(addr) && self.pushes.lock().contains_key(addr)
    }

    pub fn has_any(&self, addr: &ConnectionAddr) -> bool {
        self.subscriptions.lock().contains_key(addr) || self.pushes.lock().contains_key(addr)
    }

    pub fn push_handle(&self, addr: &ConnectionAddr) -> Option<PushHandle> {
        self.pushes.lock().get(addr).map(|push| push.handle.clone())
    }

    /// Addresses with at least one open connection
    pub fn connected(&self) -> Vec<ConnectionAddr> {
        let mut addrs: Vec<ConnectionAddr> = self.subscriptions.lock().keys().cloned().collect();
        for addr in self.pushes.lock().keys() {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        addrs.sort();
        addrs
    }

    /// Write a frame to every subscriber of the publish socket. Returns the
    /// number of subscribers it was queued for.
    pub fn publish(&self, frame: Bytes) -> usize {
        let mut sessions = self.sessions.lock();
        let mut dead = Vec::new();
        for (id, session) in sessions.iter() {
            if session.tx.send(frame.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            sessions.remove(&id);
        }
        sessions.len()
    }

    /// Push a frame over every open push connection
    pub fn push_all(&self, frame: Bytes) -> usize {
        let handles: Vec<PushHandle> = self
            .pushes
            .lock()
            .values()
            .map(|push| push.handle.clone())
            .collect();

        handles
            .iter()
            .filter(|handle| handle.send(frame.clone()).is_ok())
            .count()
    }

    /// Stop publishing to the subscriber that identified as `addr`
    pub fn drop_subscriber(&self, addr: &ConnectionAddr) -> usize {
        let mut sessions = self.sessions.lock();
        let ids: Vec<u64> = sessions
            .iter()
            .filter(|(_, session)| &session.identity == addr)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(session) = sessions.remove(id) {
                session.cancel.cancel();
            }
        }
        ids.len()
    }

    /// Close both connections to `addr` and wait for them to finish.
    /// Returns false if nothing was open.
    pub async fn disconnect(&self, addr: &ConnectionAddr) -> bool {
        let subscription = self.subscriptions.lock().remove(addr);
        let push = self.pushes.lock().remove(addr).map(|push| push.link);
        let dropped = self.drop_subscriber(addr);

        let existed = subscription.is_some() || push.is_some();
        for link in subscription.into_iter().chain(push) {
            link.cancel.cancel();
            let _ = link.task.await;
        }

        if existed {
            debug!(
                "Disconnected from {} ({} publish sessions dropped)",
                addr, dropped
            );
        }
        existed
    }

    /// Stop accepting connections and stop reading inbound frames.
    /// Outgoing traffic keeps flowing until [`close`](Self::close).
    pub fn stop_inbound(&self) {
        self.inbound.cancel();
    }

    /// Run `task` alongside the connection tasks; [`close`](Self::close)
    /// waits for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// A token cancelled when the fabric closes
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Close every peer connection and both bound sockets, waiting for each.
    pub async fn close(&self) {
        self.inbound.cancel();
        self.shutdown.cancel();

        let mut tasks: Vec<JoinHandle<()>> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, link)| link.task)
            .collect();
        tasks.extend(self.pushes.lock().drain().map(|(_, push)| push.link.task));
        self.sessions.lock().clear();

        let peer_links = tasks.len();
        futures::future::join_all(tasks).await;

        self.tracker.close();
        self.tracker.wait().await;

        info!(
            "Socket fabric on {} closed ({} peer links)",
            self.local, peer_links
        );
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_publish_accept(&self, listener: TcpListener) {
        let cancel = self.inbound.clone();
        let shutdown = self.shutdown.clone();
        let sessions = Arc::clone(&self.sessions);
        let next_id = Arc::clone(&self.next_id);
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!("Subscriber connected from {}", remote);
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        tracker.spawn(run_publish_session(
                            id,
                            stream,
                            Arc::clone(&sessions),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept subscriber: {}", e),
                }
            }
            debug!("Publish accept loop stopped");
        });
    }

    fn spawn_pull_accept(&self, listener: TcpListener) {
        let cancel = self.inbound.clone();
        let inbound_tx = self.inbound_tx.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!("Push connection accepted from {}", remote);
                        tracker.spawn(run_pull_session(
                            stream,
                            inbound_tx.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept push connection: {}", e),
                }
            }
            debug!("Pull accept loop stopped");
        });
    }
}

impl std::fmt::Debug for SocketFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFabric")
            .field("local", &self.local)
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("pushes", &self.pushes.lock().len())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Drop for SocketFabric {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Rewrite `addr` with its host resolved to an IP, preferring IPv4.
/// IP literals are returned unchanged.
pub async fn resolve(addr: &ConnectionAddr) -> ClusterResult<ConnectionAddr> {
    if addr.host.parse::<IpAddr>().is_ok() {
        return Ok(addr.clone());
    }

    let endpoint = addr.pubsub_endpoint();
    let lookup = tokio::net::lookup_host(endpoint.clone());
    let resolved: Vec<SocketAddr> = match tokio::time::timeout(CONNECT_TIMEOUT, lookup).await {
        Ok(Ok(resolved)) => resolved.collect(),
        Ok(Err(source)) => return Err(ClusterError::Connect { endpoint, source }),
        Err(_) => {
            return Err(ClusterError::Connect {
                endpoint,
                source: io::Error::new(io::ErrorKind::TimedOut, "host lookup timed out"),
            })
        }
    };

    let ip = resolved
        .iter()
        .find(|candidate| candidate.is_ipv4())
        .or_else(|| resolved.first())
        .map(|candidate| candidate.ip());
    match ip {
        Some(ip) => Ok(ConnectionAddr {
            host: ip.to_string(),
            ..addr.clone()
        }),
        None => Err(ClusterError::Connect {
            endpoint,
            source: io::Error::new(io::ErrorKind::NotFound, "host has no addresses"),
        }),
    }
}

async fn bind_listener(host: &str, port: u16) -> ClusterResult<TcpListener> {
    let endpoint = format!("{}:{}", host, port);
    TcpListener::bind(&endpoint)
        .await
        .map_err(|source| ClusterError::Bind { endpoint, source })
}

async fn await_ready(
    ready: oneshot::Receiver<io::Result<()>>,
    endpoint: String,
) -> ClusterResult<()> {
    match ready.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ClusterError::Connect { endpoint, source }),
        Err(_) => Err(ClusterError::Connect {
            endpoint,
            source: io::Error::new(io::ErrorKind::Interrupted, "connection task ended"),
        }),
    }
}

/// Remove a link entry, but only the one this task created
fn forget<T>(links: &LinkMap<T>, addr: &ConnectionAddr, id: u64, id_of: impl Fn(&T) -> u64) {
    let mut links = links.lock();
    if links.get(addr).map(&id_of) == Some(id) {
        links.remove(addr);
    }
}

async fn connect_or_cancel(endpoint: &str, cancel: &CancellationToken) -> io::Result<TcpStream> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "connection cancelled"));
        }
        stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)) => match stream {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", CONNECT_TIMEOUT),
                ));
            }
        },
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

struct SubscriberTask {
    id: u64,
    addr: ConnectionAddr,
    identity: Bytes,
    inbound_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    ready: oneshot::Sender<io::Result<()>>,
    links: LinkMap<Link>,
    events: EventBus,
}

async fn run_subscriber(task: SubscriberTask) {
    let SubscriberTask {
        id,
        addr,
        identity,
        inbound_tx,
        cancel,
        ready,
        links,
        events,
    } = task;
    let forget_self = || forget(&links, &addr, id, |link: &Link| link.id);

    let mut framed = match connect_or_cancel(&addr.pubsub_endpoint(), &cancel).await {
        Ok(stream) => Framed::new(stream, LengthDelimitedCodec::new()),
        Err(e) => {
            forget_self();
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = framed.send(identity).await {
        forget_self();
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                metrics::counter!("tether_messages_received_total", "channel" => "broadcast")
                    .increment(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = inbound_tx.send(frame.freeze()) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                events.error(ClusterError::Transport(format!(
                    "broadcast link to {} failed: {}",
                    addr.pubsub_endpoint(),
                    e
                )));
                break;
            }
            None => {
                debug!("Publisher {} closed the connection", addr.pubsub_endpoint());
                break;
            }
        }
    }

    forget_self();
}

struct PushTask {
    id: u64,
    addr: ConnectionAddr,
    rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    ready: oneshot::Sender<io::Result<()>>,
    links: LinkMap<PushLink>,
    events: EventBus,
}

async fn run_push(task: PushTask) {
    let PushTask {
        id,
        addr,
        mut rx,
        cancel,
        ready,
        links,
        events,
    } = task;
    let forget_self = || forget(&links, &addr, id, |push: &PushLink| push.link.id);

    let mut sink = match connect_or_cancel(&addr.pipeline_endpoint(), &cancel).await {
        Ok(stream) => FramedWrite::new(stream, LengthDelimitedCodec::new()),
        Err(e) => {
            forget_self();
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        events.error(ClusterError::Transport(format!(
                            "push link to {} failed: {}",
                            addr.pipeline_endpoint(),
                            e
                        )));
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = SinkExt::<Bytes>::close(&mut sink).await;
                break;
            }
        }
    }

    forget_self();
}

async fn run_publish_session(
    id: u64,
    stream: TcpStream,
    sessions: SessionMap,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()) => handshake,
    };
    let identity = match handshake {
        Ok(Some(Ok(frame))) => match serde_json::from_slice::<ConnectionAddr>(&frame) {
            Ok(identity) => identity,
            Err(_) => {
                debug!("Discarding subscriber with malformed handshake");
                return;
            }
        },
        _ => {
            debug!("Subscriber went away before its handshake");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    sessions.lock().insert(
        id,
        Session {
            identity: identity.clone(),
            tx,
            cancel: cancel.clone(),
        },
    );
    debug!("Subscriber {} registered", identity);

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if framed.feed(frame).await.is_err() {
                        break;
                    }
                }
                let _ = SinkExt::<Bytes>::close(&mut framed).await;
                break;
            }
            incoming = framed.next() => match incoming {
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    sessions.lock().remove(&id);
    debug!("Subscriber {} gone", identity);
}

async fn run_pull_session(stream: TcpStream, inbound_tx: mpsc::Sender<Bytes>, cancel: CancellationToken) {
    let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                metrics::counter!("tether_messages_received_total", "channel" => "direct")
                    .increment(1);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = inbound_tx.send(frame.freeze()) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                debug!("Dropping push connection after framing error: {}", e);
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> PeerAddress {
        PeerAddress::new("127.0.0.1").with_ports(0, 0)
    }

    async fn fabric() -> (SocketFabric, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(64);
        let fabric = SocketFabric::bind(&loopback(), tx, EventBus::new(16))
            .await
            .unwrap();
        (fabric, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_bind_reports_actual_ports() {
        let (fabric, _rx) = fabric().await;
        assert_ne!(fabric.local_addr().pubsub_port, 0);
        assert_ne!(fabric.local_addr().pipeline_port, 0);
        fabric.close().await;
    }

    #[tokio::test]
    async fn test_bind_fails_on_taken_port() {
        let (first, _rx) = fabric().await;
        let taken = PeerAddress::new("127.0.0.1")
            .with_ports(first.local_addr().pubsub_port, 0);

        let (tx, _rx2) = mpsc::channel(1);
        let result = SocketFabric::bind(&taken, tx, EventBus::new(1)).await;
        assert!(matches!(result, Err(ClusterError::Bind { .. })));
        first.close().await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (a, _rx_a) = fabric().await;
        let (b, _rx_b) = fabric().await;

        let first = a.connect_direct(b.local_addr()).await.unwrap();
        let second = a.connect_direct(b.local_addr()).await.unwrap();
        assert_eq!(first.id(), second.id());

        let sub1 = a.connect_broadcast(b.local_addr()).await.unwrap();
        let sub2 = a.connect_broadcast(b.local_addr()).await.unwrap();
        assert_eq!(sub1, sub2);
        assert!(a.has_both(b.local_addr()));
        assert_eq!(a.connected(), vec![b.local_addr().clone()]);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_push_reaches_pull_in_order() {
        let (a, _rx_a) = fabric().await;
        let (b, mut rx_b) = fabric().await;

        let push = a.connect_direct(b.local_addr()).await.unwrap();
        for i in 0..10u8 {
            push.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(recv(&mut rx_b).await, Bytes::from(vec![i]));
        }

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (a, mut rx_a) = fabric().await;
        let (b, _rx_b) = fabric().await;

        a.connect_broadcast(b.local_addr()).await.unwrap();
        // Wait for b to register the subscription handshake
        for _ in 0..100 {
            if b.publish(Bytes::from_static(b"hello")) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recv(&mut rx_a).await, Bytes::from_static(b"hello"));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_drop_subscriber_stops_delivery() {
        let (a, _rx_a) = fabric().await;
        let (b, _rx_b) = fabric().await;

        a.connect_broadcast(b.local_addr()).await.unwrap();
        for _ in 0..100 {
            if b.publish(Bytes::from_static(b"hello")) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(b.drop_subscriber(a.local_addr()), 1);
        assert_eq!(b.publish(Bytes::from_static(b"after")), 0);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_handle() {
        let (a, _rx_a) = fabric().await;
        let (b, _rx_b) = fabric().await;
        let gone = b.local_addr().clone();
        b.close().await;

        let result = a.connect_direct(&gone).await;
        assert!(matches!(result, Err(ClusterError::Connect { .. })));
        assert!(a.push_handle(&gone).is_none());
        assert!(!a.has_any(&gone));

        a.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_silent_host_gives_up() {
        let (a, _rx_a) = fabric().await;
        // TEST-NET-1, never answers
        let silent = ConnectionAddr {
            host: "192.0.2.1".to_string(),
            pubsub_port: 6021,
            pipeline_port: 6022,
        };

        let result = a.connect_direct(&silent).await;
        assert!(matches!(result, Err(ClusterError::Connect { .. })));
        assert!(!a.has_any(&silent));

        a.close().await;
    }

    #[tokio::test]
    async fn test_resolve_prefers_ip_literal() {
        let named = ConnectionAddr {
            host: "localhost".to_string(),
            pubsub_port: 7001,
            pipeline_port: 7002,
        };
        let resolved = resolve(&named).await.unwrap();
        assert!(resolved.host.parse::<IpAddr>().unwrap().is_loopback());
        assert_eq!(resolved.pubsub_port, 7001);
        assert_eq!(resolved.pipeline_port, 7002);

        let literal = ConnectionAddr {
            host: "10.1.2.3".to_string(),
            ..named
        };
        assert_eq!(resolve(&literal).await.unwrap(), literal);
    }

    #[tokio::test]
    async fn test_bind_reports_ip_host() {
        let (tx, _rx) = mpsc::channel(1);
        let bind = PeerAddress::new("localhost").with_ports(0, 0);
        let fabric = SocketFabric::bind(&bind, tx, EventBus::new(1)).await.unwrap();
        assert!(fabric.local_addr().host.parse::<IpAddr>().is_ok());
        fabric.close().await;
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (a, _rx_a) = fabric().await;
        let (b, _rx_b) = fabric().await;

        let push = a.connect_direct(b.local_addr()).await.unwrap();
        a.connect_broadcast(b.local_addr()).await.unwrap();

        assert!(a.disconnect(b.local_addr()).await);
        assert!(!a.has_any(b.local_addr()));
        assert!(push.send(Bytes::from_static(b"late")).is_err());
        assert!(!a.disconnect(b.local_addr()).await);

        a.close().await;
        b.close().await;
    }
}
