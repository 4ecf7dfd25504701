//! Client controller - one outbound connection.
//!
//! [`ClientController`] dials a server, hands the socket to a
//! [`ConnectionWorker`](crate::connection::ConnectionWorker) task, and exposes
//! the worker's events through [`next_event`](ClientController::next_event).
//! Socket I/O never runs on the caller's task.
//!
//! Connection failures are reported, never retried internally: call
//! [`connect_to_host`](ClientController::connect_to_host) or
//! [`reconnect`](ClientController::reconnect) again on whatever schedule
//! suits the deployment.
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use igtlink_transport::{ClientController, Event, Message};
//!
//! #[tokio::main]
//! async fn main() -> igtlink_transport::Result<()> {
//!     let mut client = ClientController::builder()
//!         .connect_timeout(std::time::Duration::from_secs(2))
//!         .device_name("Tracker")
//!         .build();
//!
//!     client.connect_to_host("127.0.0.1", 18944).await?;
//!     client.send(&Message::new("STRING", "Tracker", Bytes::from_static(b"hello"))).await?;
//!
//!     while let Some(event) = client.next_event().await {
//!         match event {
//!             Event::MessageSent { start_ns, end_ns } => {
//!                 println!("sent in {} ns", end_ns - start_ns)
//!             }
//!             Event::NoIncomingData => break,
//!             _ => {}
//!         }
//!     }
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::{Codec, IgtlCodec, Message};
use crate::config::{saturating_millis, TransportConfig};
use crate::connection::{spawn_tcp_worker, Role, WorkerHandle};
use crate::error::{Result, TransportError};
use crate::event::{Event, EventSink, SocketErrorKind};

/// Builder for configuring and creating a [`ClientController`].
pub struct ClientBuilder {
    config: TransportConfig,
    codec: Arc<dyn Codec>,
}

impl ClientBuilder {
    /// Create a builder with default configuration and [`IgtlCodec`].
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            codec: Arc::new(IgtlCodec::new()),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connect timeout.
    ///
    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Set the keep-alive interval, or `None` to disable heartbeats.
    ///
    /// Default: 1 second
    pub fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keep_alive_interval_ms = interval.map(saturating_millis);
        self
    }

    /// Set the inactivity threshold, or `None` to disable `NoIncomingData`.
    ///
    /// Default: 5 seconds
    pub fn no_incoming_data_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.config.no_incoming_data_ms = threshold.map(saturating_millis);
        self
    }

    /// Set the sanity bound on inbound body lengths.
    pub fn max_body_length(mut self, max: u64) -> Self {
        self.config.max_body_length = max;
        self
    }

    /// Set the outbound queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set how many undrained events are kept; newer ones are dropped.
    ///
    /// Default: 1024
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Device name stamped on heartbeats.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.device_name = name.into();
        self
    }

    /// Use a different protocol codec.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build the controller. Nothing is connected yet.
    pub fn build(self) -> ClientController {
        ClientController::from_parts(self.config, self.codec)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a single outbound connection.
///
/// [`stop`](Self::stop) consumes the controller, so it cannot be reused or
/// stopped twice.
pub struct ClientController {
    config: TransportConfig,
    codec: Arc<dyn Codec>,
    events: EventSink,
    events_rx: mpsc::Receiver<Event>,
    connection: Option<WorkerHandle>,
    target: Option<(String, u16)>,
}

impl ClientController {
    /// Create a controller with default configuration.
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    /// Create a controller with the given configuration.
    pub fn with_config(config: TransportConfig) -> Self {
        ClientBuilder::new().config(config).build()
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn from_parts(config: TransportConfig, codec: Arc<dyn Codec>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        Self {
            config,
            codec,
            events: events_tx.into(),
            events_rx,
            connection: None,
            target: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connect to `host:port` within the configured timeout.
    ///
    /// Emits [`Event::ConnectedToServer`] on success. On failure emits
    /// [`Event::ConnectionFailed`], returns the error, and leaves the
    /// controller ready for another attempt.
    pub async fn connect_to_host(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        // Release a worker that ended on its own.
        if let Some(stale) = self.connection.take() {
            stale.abort().await;
        }

        self.target = Some((host.to_string(), port));
        tracing::info!(host, port, "Connecting");

        let stream = self.dial(TcpStream::connect((host, port))).await?;
        let handle = match spawn_tcp_worker(
            stream,
            Role::Client,
            self.codec.clone(),
            &self.config,
            self.events.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let kind = match &e {
                    TransportError::Io(err) => SocketErrorKind::from(err),
                    _ => SocketErrorKind::Unknown,
                };
                return Err(self.connection_failed(kind, e));
            }
        };

        let peer = handle.peer();
        self.connection = Some(handle);
        tracing::info!(%peer, "Connected to server");
        self.events.deliver(Event::ConnectedToServer { peer });
        Ok(())
    }

    /// Run a connect attempt under the configured timeout.
    async fn dial<F>(&self, connect: F) -> Result<TcpStream>
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                let kind = SocketErrorKind::from(&e);
                Err(self.connection_failed(kind, e.into()))
            }
            Err(_) => {
                let err = TransportError::ConnectTimeout(timeout);
                Err(self.connection_failed(SocketErrorKind::Timeout, err))
            }
        }
    }

    fn connection_failed(&self, kind: SocketErrorKind, err: TransportError) -> TransportError {
        tracing::warn!(?kind, "Connection failed: {}", err);
        self.events.deliver(Event::ConnectionFailed {
            kind,
            reason: err.to_string(),
        });
        err
    }

    /// Abort the current connection and connect again to the last target.
    pub async fn reconnect(&mut self) -> Result<()> {
        let (host, port) = self.target.clone().ok_or(TransportError::NotConnected)?;
        self.disconnect().await;
        self.connect_to_host(&host, port).await
    }

    /// Abort the current connection. The controller stays usable.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.connection.take() {
            tracing::info!(peer = %handle.peer(), "Disconnecting");
            handle.abort().await;
        }
    }

    /// Check if a connection is live.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn live_connection(&self) -> Result<&WorkerHandle> {
        self.connection
            .as_ref()
            .filter(|handle| !handle.is_finished())
            .ok_or(TransportError::NotConnected)
    }

    /// Queue a message for sending.
    ///
    /// Waits only for queue space; completion is reported as
    /// [`Event::MessageSent`].
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.live_connection()?.send(message).await
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: &Message) -> Result<()> {
        self.live_connection()?.try_send(message)
    }

    /// Next event, waiting if none is pending.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Next event if one is already pending.
    pub fn try_next_event(&mut self) -> Option<Event> {
        self.events_rx.try_recv().ok()
    }

    /// Shut down: abort the worker, close the socket, drop the event stream.
    ///
    /// No event can be observed after this returns.
    pub async fn stop(mut self) {
        self.events_rx.close();
        self.disconnect().await;
        tracing::info!("Client stopped");
    }
}

impl Default for ClientController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_builder_configuration() {
        let client = ClientController::builder()
            .connect_timeout(Duration::from_millis(1500))
            .keep_alive_interval(None)
            .no_incoming_data_threshold(Some(Duration::from_secs(2)))
            .max_body_length(4096)
            .channel_capacity(16)
            .device_name("Tracker")
            .build();

        let config = client.config();
        assert_eq!(config.connect_timeout_ms, 1500);
        assert_eq!(config.keep_alive_interval_ms, None);
        assert_eq!(config.no_incoming_data_ms, Some(2000));
        assert_eq!(config.max_body_length, 4096);
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.device_name, "Tracker");
    }

    #[test]
    fn test_default_uses_default_config() {
        let client = ClientController::default();
        assert_eq!(client.config(), &TransportConfig::default());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = ClientController::new();
        let message = Message::new("STRING", "x", Bytes::new());

        assert!(matches!(client.send(&message).await, Err(TransportError::NotConnected)));
        assert!(matches!(client.try_send(&message), Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconnect_without_target_fails() {
        let mut client = ClientController::new();
        assert!(matches!(client.reconnect().await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = ClientController::new();
        let result = client.connect_to_host("127.0.0.1", port).await;

        assert!(result.is_err());
        assert!(!client.is_connected());
        match client.try_next_event() {
            Some(Event::ConnectionFailed { kind, .. }) => {
                assert_eq!(kind, SocketErrorKind::Refused)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_builder_durations_saturate() {
        let client = ClientController::builder()
            .connect_timeout(Duration::MAX)
            .keep_alive_interval(Some(Duration::MAX))
            .build();

        assert_eq!(client.config().connect_timeout_ms, u64::MAX);
        assert_eq!(client.config().keep_alive_interval_ms, Some(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_reported() {
        let mut client = ClientController::builder()
            .connect_timeout(Duration::from_millis(50))
            .build();

        // A connect attempt that never completes.
        let result = client
            .dial(std::future::pending::<io::Result<TcpStream>>())
            .await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectTimeout(d)) if d == Duration::from_millis(50)
        ));
        match client.try_next_event() {
            Some(Event::ConnectionFailed { kind, reason }) => {
                assert_eq!(kind, SocketErrorKind::Timeout);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_ignored_events_stay_bounded() {
        let mut client = ClientController::builder().event_queue_capacity(4).build();

        for _ in 0..100 {
            client.events.deliver(Event::NoIncomingData);
        }

        let mut queued = 0;
        while client.try_next_event().is_some() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[tokio::test]
    async fn test_stop_unconnected() {
        let client = ClientController::new();
        client.stop().await;
    }
}
