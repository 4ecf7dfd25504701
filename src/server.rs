//! Server listener - accepts and multiplexes inbound connections.
//!
//! ```text
//! TcpListener ─► accept task ─► spawn_tcp_worker (one task per peer)
//!                                      │ worker events
//!                                      ▼
//!                                routing task ─► MessageManager[source port]
//!                                      │      └► consumer channel[source port]
//!                                      ▼
//!                          ServerListener::next_event
//! ```
//!
//! Messages are keyed by the peer's source port. The mailbox keeps only the
//! latest message per port; a registered consumer channel receives every
//! message from its port, in order. The listener's own event stream is
//! bounded and drops new events while full, so it may be ignored entirely.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{Codec, IgtlCodec, Message};
use crate::config::TransportConfig;
use crate::connection::{spawn_tcp_worker, Role, WorkerHandle};
use crate::error::{Result, TransportError};
use crate::event::{Event, EventSink, SocketErrorKind};
use crate::message::{MessageContainer, MessageManager};

/// Well-known OpenIGTLink port.
pub const DEFAULT_PORT: u16 = 18944;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Builder for configuring and binding a [`ServerListener`].
pub struct ServerBuilder {
    port: u16,
    bind_address: IpAddr,
    config: TransportConfig,
    codec: Arc<dyn Codec>,
}

impl ServerBuilder {
    /// Create a builder listening on all interfaces at [`DEFAULT_PORT`].
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config: TransportConfig::server_default(),
            codec: Arc::new(IgtlCodec::new()),
        }
    }

    /// Set the listening port. `0` picks a free port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the local address to bind.
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Configuration applied to every accepted connection.
    ///
    /// Default: [`TransportConfig::server_default`]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how many undrained listener events are kept; newer ones are
    /// dropped. Routing into the mailbox and consumers is unaffected.
    ///
    /// Default: 1024
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Use a different protocol codec.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Bind the socket and start accepting.
    pub async fn bind(self) -> Result<ServerListener> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_address, self.port)).await?;
        ServerListener::start(listener, self.config, self.codec)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing tables shared by the listener, the accept task and the routing task.
///
/// Locks are held only for map operations, never across an await.
struct Shared {
    connections: Mutex<HashMap<u16, WorkerHandle>>,
    consumers: Mutex<HashMap<u16, mpsc::UnboundedSender<MessageContainer>>>,
    manager: Arc<MessageManager>,
}

/// Accepts inbound connections and routes their messages by source port.
///
/// [`stop`](Self::stop) consumes the listener.
pub struct ServerListener {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<Event>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: JoinHandle<()>,
    routing_task: JoinHandle<()>,
}

impl ServerListener {
    /// Bind on all interfaces at `port` with default settings.
    pub async fn bind(port: u16) -> Result<Self> {
        ServerBuilder::new().port(port).bind().await
    }

    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    fn start(
        listener: TcpListener,
        config: TransportConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            connections: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            manager: Arc::new(MessageManager::new()),
        });

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared.clone(),
            config,
            codec,
            worker_tx,
            shutdown_rx,
        ));
        let routing_task = tokio::spawn(route_events(
            shared.clone(),
            worker_rx,
            events_tx.into(),
        ));

        tracing::info!(%local_addr, "Server listening");

        Ok(Self {
            local_addr,
            shared,
            events_rx,
            shutdown_tx: Some(shutdown_tx),
            accept_task,
            routing_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest-value mailbox fed with every received message.
    pub fn manager(&self) -> Arc<MessageManager> {
        self.shared.manager.clone()
    }

    /// Peers with a live connection.
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<_> = self
            .shared
            .connections
            .lock()
            .values()
            .map(WorkerHandle::peer)
            .collect();
        peers.sort();
        peers
    }

    /// Receive every message arriving from source `port`, in order.
    ///
    /// Replaces an earlier registration for the same port. The channel
    /// closes when that peer disconnects.
    pub fn register_consumer(&self, port: u16) -> mpsc::UnboundedReceiver<MessageContainer> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.consumers.lock().insert(port, tx);
        rx
    }

    /// Drop the consumer registered for `port`, if any.
    pub fn unregister_consumer(&self, port: u16) {
        self.shared.consumers.lock().remove(&port);
    }

    /// Queue a message to the peer connected from `port`.
    pub fn send_to(&self, port: u16, message: &Message) -> Result<()> {
        self.shared
            .connections
            .lock()
            .get(&port)
            .ok_or(TransportError::UnknownPeer(i32::from(port)))?
            .try_send(message)
    }

    /// Queue a message to every connected peer.
    ///
    /// Returns how many peers accepted it. A full or closed queue skips that
    /// peer.
    pub fn broadcast(&self, message: &Message) -> usize {
        let connections = self.shared.connections.lock();
        let mut delivered = 0;
        for (port, handle) in connections.iter() {
            match handle.try_send(message) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(port, "Broadcast skipped peer: {}", e),
            }
        }
        delivered
    }

    /// Next event, waiting if none is pending.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Next event if one is already pending.
    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events_rx.try_recv().ok()
    }

    /// Stop accepting, abort every connection and join all tasks.
    pub async fn stop(mut self) {
        self.events_rx.close();

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(e) = (&mut self.accept_task).await {
            tracing::error!("Accept task failed: {}", e);
        }

        let handles: Vec<_> = self.shared.connections.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort().await;
        }
        self.shared.consumers.lock().clear();

        // Ends once every worker has dropped its event sender.
        if let Err(e) = (&mut self.routing_task).await {
            tracing::error!("Routing task failed: {}", e);
        }

        tracing::info!(local_addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for ServerListener {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.routing_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    config: TransportConfig,
    codec: Arc<dyn Codec>,
    worker_tx: mpsc::UnboundedSender<Event>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => accept_one(stream, peer, &shared, &config, &codec, &worker_tx),
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

fn accept_one(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    config: &TransportConfig,
    codec: &Arc<dyn Codec>,
    worker_tx: &mpsc::UnboundedSender<Event>,
) {
    tracing::info!(%peer, "Client connected");
    // Queued before the worker exists so it precedes every worker event.
    let _ = worker_tx.send(Event::ClientConnected { peer });

    // Held across the spawn so a fast disconnect cannot be routed before
    // the handle is registered.
    let mut connections = shared.connections.lock();
    let spawned = spawn_tcp_worker(
        stream,
        Role::Server,
        codec.clone(),
        config,
        worker_tx.clone(),
    );
    match spawned {
        Ok(handle) => {
            if let Some(previous) = connections.insert(peer.port(), handle) {
                tracing::warn!(
                    %peer,
                    old = %previous.peer(),
                    "Source port reused, replacing connection"
                );
            }
        }
        Err(e) => {
            drop(connections);
            let kind = match &e {
                TransportError::Io(err) => SocketErrorKind::from(err),
                _ => SocketErrorKind::Unknown,
            };
            tracing::error!(%peer, "Cannot start connection: {}", e);
            let _ = worker_tx.send(Event::SocketError {
                peer,
                kind,
                reason: e.to_string(),
            });
        }
    }
}

async fn route_events(
    shared: Arc<Shared>,
    mut worker_rx: mpsc::UnboundedReceiver<Event>,
    events: EventSink,
) {
    while let Some(event) = worker_rx.recv().await {
        match &event {
            Event::MessageReceived(container) => route_message(&shared, container),
            Event::SocketDisconnected { peer } | Event::SocketError { peer, .. } => {
                release(&shared, *peer).await;
            }
            _ => {}
        }

        // Listener stopped or its stream is full; keep routing.
        events.deliver(event);
    }
    tracing::debug!("Routing task stopped");
}

fn route_message(shared: &Shared, container: &MessageContainer) {
    let key = container.sender_port();
    shared.manager.insert(key, container.clone());

    let Ok(port) = u16::try_from(key) else {
        return;
    };
    let mut consumers = shared.consumers.lock();
    if let Some(consumer) = consumers.get(&port) {
        if consumer.send(container.clone()).is_err() {
            tracing::debug!(port, "Consumer dropped, unregistering");
            consumers.remove(&port);
        }
    }
}

async fn release(shared: &Shared, peer: SocketAddr) {
    let port = peer.port();
    let handle = {
        let mut connections = shared.connections.lock();
        match connections.get(&port) {
            Some(handle) if handle.peer() == peer => connections.remove(&port),
            _ => None,
        }
    };
    shared.consumers.lock().remove(&port);

    if let Some(handle) = handle {
        tracing::info!(%peer, "Connection released");
        handle.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    async fn local_server() -> ServerListener {
        ServerListener::builder()
            .port(0)
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .bind()
            .await
            .unwrap()
    }

    fn packed_bytes(message: &Message) -> Vec<u8> {
        let packed = IgtlCodec::new().pack(message).unwrap();
        let mut bytes = packed.header.to_vec();
        bytes.extend_from_slice(&packed.body);
        bytes
    }

    #[test]
    fn test_builder_defaults() {
        let builder = ServerBuilder::new();
        assert_eq!(builder.port, DEFAULT_PORT);
        assert_eq!(builder.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(builder.config, TransportConfig::server_default());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = local_server().await;
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.connected_peers().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let server = local_server().await;
        let message = Message::new("STRING", "srv", Bytes::new());

        assert!(matches!(
            server.send_to(4242, &message),
            Err(TransportError::UnknownPeer(4242))
        ));
        assert_eq!(server.broadcast(&message), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_routes_by_source_port() {
        let mut server = local_server().await;
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let port = stream.local_addr().unwrap().port();
        let mut consumer = server.register_consumer(port);

        assert!(matches!(server.next_event().await, Some(Event::ClientConnected { .. })));

        for i in 0..3u8 {
            let message = Message::new("STRING", "stylus", Bytes::from(vec![i; 4]));
            stream.write_all(&packed_bytes(&message)).await.unwrap();
        }

        for i in 0..3u8 {
            let container = consumer.recv().await.unwrap();
            assert_eq!(container.sender_port(), i32::from(port));
            assert_eq!(container.payload().unwrap().body.as_ref(), &[i; 4]);
        }

        // Mailbox holds only the latest one.
        let latest = server.manager().get(i32::from(port)).unwrap();
        assert_eq!(latest.payload().unwrap().body.as_ref(), &[2u8; 4]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_routing() {
        let mut server = local_server().await;
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let port = stream.local_addr().unwrap().port();
        let mut consumer = server.register_consumer(port);

        assert!(matches!(server.next_event().await, Some(Event::ClientConnected { .. })));
        drop(stream);
        assert!(matches!(
            server.next_event().await,
            Some(Event::SocketDisconnected { peer }) if peer.port() == port
        ));

        assert!(consumer.recv().await.is_none());
        assert!(server.connected_peers().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_undrained_events_stay_bounded() {
        let mut server = ServerListener::builder()
            .port(0)
            .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .event_queue_capacity(16)
            .bind()
            .await
            .unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let port = i32::from(stream.local_addr().unwrap().port());

        let count = 2000u32;
        let mut bytes = Vec::new();
        for i in 0..count {
            let body = Bytes::copy_from_slice(&i.to_be_bytes());
            bytes.extend(packed_bytes(&Message::new("TRANSFORM", "tracker", body)));
        }
        stream.write_all(&bytes).await.unwrap();

        // Only the mailbox is read.
        let last = (count - 1).to_be_bytes();
        let manager = server.manager();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = manager
                    .get(port)
                    .is_some_and(|c| c.payload().is_some_and(|m| m.body[..] == last));
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.len(), 1);

        let mut queued = 0;
        while server.try_next_event().is_some() {
            queued += 1;
        }
        assert!(queued <= 16, "{} events queued", queued);

        server.stop().await;
    }
}
