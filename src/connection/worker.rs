//! Per-connection I/O loop.
//!
//! Each TCP connection, whether dialed by a client or accepted by the
//! server, is owned by one [`ConnectionWorker`] task plus a dedicated writer
//! task for its write half:
//!
//! ```text
//! WorkerHandle::send ─► mpsc<OutboundFrame> ─► writer task ─► socket
//! WorkerHandle::abort ─► oneshot ─┐                  │ WriteReport
//!                                 ▼                  ▼
//!          socket ─► ConnectionWorker (select! loop) ─► EventSink ─► owner
//!                                 ▲
//!               housekeeping tick ┘  (keep-alive, inactivity)
//! ```
//!
//! The worker keeps reading while a write is in flight, so two peers pushing
//! large messages at each other cannot stall on full socket buffers.
//!
//! The abort signal is polled first on every iteration. Once the worker sees
//! it, nothing else is emitted. Bytes already read before the abort have
//! already been reassembled and emitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::reassembler::Reassembler;
use super::writer::{spawn_writer_task, OutboundFrame, WriteReport};
use crate::clock;
use crate::codec::{Codec, Message};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::event::{Event, EventSink, SocketErrorKind};

/// Which side of the connection a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound connection dialed by a `ClientController`.
    Client,
    /// Connection accepted by a `ServerListener`.
    Server,
}

/// Housekeeping tick when no timer is configured.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Shortest housekeeping tick.
const MIN_TICK: Duration = Duration::from_millis(1);

enum Flow {
    Continue,
    Stop,
}

/// Owner side of a running [`ConnectionWorker`].
///
/// Dropping the handle aborts the worker.
pub struct WorkerHandle {
    peer: SocketAddr,
    role: Role,
    codec: Arc<dyn Codec>,
    outbound: mpsc::Sender<OutboundFrame>,
    abort_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Address of the remote peer.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Pack and queue a message.
    ///
    /// Returns once the frame is queued; completion is reported as
    /// [`Event::MessageSent`].
    pub async fn send(&self, message: &Message) -> Result<()> {
        let frame = self.pack(message)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Queue a message without waiting for queue space.
    pub fn try_send(&self, message: &Message) -> Result<()> {
        let frame = self.pack(message)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    fn pack(&self, message: &Message) -> Result<OutboundFrame> {
        let queued_at = clock::now_nanos();
        Ok(OutboundFrame::new(self.codec.pack(message)?, queued_at))
    }

    /// Check if the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the worker and wait for its task to exit.
    ///
    /// No event is emitted by the worker after this returns, and the socket
    /// is closed.
    pub async fn abort(mut self) {
        if let Some(abort_tx) = self.abort_tx.take() {
            let _ = abort_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!(peer = %self.peer, "Connection worker failed: {}", e);
        }
    }
}

/// Task owning the read half of one socket and its housekeeping.
pub struct ConnectionWorker<R> {
    role: Role,
    peer: SocketAddr,
    reader: R,
    reassembler: Reassembler,
    codec: Arc<dyn Codec>,
    events: EventSink,
    frames: mpsc::Sender<OutboundFrame>,
    keep_alive_interval: Option<Duration>,
    no_incoming_data: Option<Duration>,
    device_name: String,
    read_buffer_size: usize,
    last_read: Instant,
    last_write: Instant,
    silence_reported: bool,
}

/// Spawn a worker over an accepted or dialed TCP stream.
pub fn spawn_tcp_worker(
    stream: TcpStream,
    role: Role,
    codec: Arc<dyn Codec>,
    config: &TransportConfig,
    events: impl Into<EventSink>,
) -> Result<WorkerHandle> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(spawn_worker(reader, writer, peer, role, codec, config, events))
}

/// Spawn a worker over arbitrary read/write halves.
pub fn spawn_worker<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    role: Role,
    codec: Arc<dyn Codec>,
    config: &TransportConfig,
    events: impl Into<EventSink>,
) -> WorkerHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity.max(1));
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let (abort_tx, abort_rx) = oneshot::channel();

    let writer_task = spawn_writer_task(writer, outbound_rx, reports_tx);
    let worker = ConnectionWorker::new(
        reader,
        peer,
        role,
        codec.clone(),
        config,
        events,
        outbound_tx.clone(),
    );
    let task = tokio::spawn(worker.run(reports_rx, writer_task, abort_rx));

    WorkerHandle {
        peer,
        role,
        codec,
        outbound: outbound_tx,
        abort_tx: Some(abort_tx),
        task,
    }
}

impl<R> ConnectionWorker<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a worker. Use [`spawn_worker`] to run it.
    ///
    /// `frames` feeds the writer task; the worker queues heartbeats on it.
    pub fn new(
        reader: R,
        peer: SocketAddr,
        role: Role,
        codec: Arc<dyn Codec>,
        config: &TransportConfig,
        events: impl Into<EventSink>,
        frames: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let now = Instant::now();
        let reassembler =
            Reassembler::with_max_body_length(codec.clone(), peer, config.max_body_length);
        Self {
            role,
            peer,
            reader,
            reassembler,
            codec,
            events: events.into(),
            frames,
            keep_alive_interval: config.keep_alive_interval(),
            no_incoming_data: config.no_incoming_data_threshold(),
            device_name: config.device_name.clone(),
            read_buffer_size: config.read_buffer_size.max(1),
            last_read: now,
            last_write: now,
            silence_reported: false,
        }
    }

    /// Run until the peer disconnects, the socket fails, or the owner aborts.
    ///
    /// `writer_task` is aborted and joined before this returns.
    pub(crate) async fn run(
        mut self,
        mut reports: mpsc::UnboundedReceiver<WriteReport>,
        writer_task: JoinHandle<()>,
        mut abort: oneshot::Receiver<()>,
    ) {
        tracing::info!(peer = %self.peer, role = ?self.role, "Connection worker started");

        let mut buf = vec![0u8; self.read_buffer_size];
        let mut ticker = tokio::time::interval(self.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                biased;

                _ = &mut abort => {
                    self.reassembler.abort();
                    tracing::debug!(peer = %self.peer, "Connection worker aborted");
                    Flow::Stop
                }

                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        self.reassembler.abort();
                        tracing::info!(peer = %self.peer, "Peer disconnected");
                        let _ = self.emit(Event::SocketDisconnected { peer: self.peer });
                        Flow::Stop
                    }
                    Ok(n) => self.on_data(&buf[..n]),
                    Err(e) => self.fail(e),
                },

                Some(report) = reports.recv() => self.on_report(report),

                _ = ticker.tick() => self.on_tick(),
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        writer_task.abort();
        let _ = writer_task.await;
    }

    fn tick_period(&self) -> Duration {
        [self.keep_alive_interval, self.no_incoming_data]
            .into_iter()
            .flatten()
            .min()
            .map(|d| (d / 4).clamp(MIN_TICK, IDLE_TICK))
            .unwrap_or(IDLE_TICK)
    }

    /// Send an event. Returns `Stop` when the owner has gone away.
    fn emit(&self, event: Event) -> Flow {
        if self.events.deliver(event) {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn fail(&mut self, err: impl Into<TransportError>) -> Flow {
        let err = err.into();
        self.reassembler.abort();

        let (kind, reason) = match &err {
            TransportError::Io(io) => (SocketErrorKind::from(io), io.to_string()),
            other => (SocketErrorKind::Unknown, other.to_string()),
        };
        tracing::error!(peer = %self.peer, ?kind, "Socket error: {}", reason);

        let _ = self.emit(Event::SocketError {
            peer: self.peer,
            kind,
            reason,
        });
        Flow::Stop
    }

    fn on_data(&mut self, data: &[u8]) -> Flow {
        self.last_read = Instant::now();
        self.silence_reported = false;

        for result in self.reassembler.push(data) {
            let event = match result {
                Ok(container) if container.payload().is_some_and(Message::is_keep_alive) => {
                    tracing::trace!(peer = %self.peer, "Keep-alive received");
                    continue;
                }
                Ok(container) => {
                    tracing::debug!(
                        peer = %self.peer,
                        id = container.id(),
                        owner = container.owner_name(),
                        latency_ns = container.latency(),
                        "Message received"
                    );
                    Event::MessageReceived(container)
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, "Discarding malformed message: {}", e);
                    Event::MalformedMessage {
                        peer: self.peer,
                        reason: e.to_string(),
                    }
                }
            };

            if let Flow::Stop = self.emit(event) {
                return Flow::Stop;
            }
        }

        Flow::Continue
    }

    fn on_report(&mut self, report: WriteReport) -> Flow {
        match report {
            WriteReport::Written { started, end_ns } => {
                self.last_write = Instant::now();
                tracing::trace!(peer = %self.peer, messages = started.len(), "Batch written");

                for start_ns in started {
                    if let Flow::Stop = self.emit(Event::MessageSent { start_ns, end_ns }) {
                        return Flow::Stop;
                    }
                }
                Flow::Continue
            }
            WriteReport::KeepAliveFailed(e) => {
                tracing::warn!(peer = %self.peer, "Failed to send keep-alive: {}", e);
                self.emit(Event::FailedToSendKeepAliveMessage)
            }
            WriteReport::Failed(e) => self.fail(e),
        }
    }

    fn on_tick(&mut self) -> Flow {
        if let Some(threshold) = self.no_incoming_data {
            if !self.silence_reported && self.last_read.elapsed() >= threshold {
                self.silence_reported = true;
                tracing::warn!(peer = %self.peer, ?threshold, "No incoming data");
                if let Flow::Stop = self.emit(Event::NoIncomingData) {
                    return Flow::Stop;
                }
            }
        }

        if let Some(interval) = self.keep_alive_interval {
            if self.last_write.elapsed() >= interval {
                return self.send_keep_alive();
            }
        }

        Flow::Continue
    }

    fn send_keep_alive(&mut self) -> Flow {
        // Re-arm first so a failing peer gets one attempt per interval.
        self.last_write = Instant::now();

        let frame = match self.codec.pack(&Message::keep_alive(self.device_name.clone())) {
            Ok(packed) => OutboundFrame::keep_alive(packed, clock::now_nanos()),
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Cannot pack keep-alive: {}", e);
                return self.emit(Event::FailedToSendKeepAliveMessage);
            }
        };

        match self.frames.try_send(frame) {
            Ok(()) => Flow::Continue,
            // Queued messages keep the link busy anyway.
            Err(mpsc::error::TrySendError::Full(_)) => Flow::Continue,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(peer = %self.peer, "Writer gone, keep-alive not sent");
                self.emit(Event::FailedToSendKeepAliveMessage)
            }
        }
    }
}
