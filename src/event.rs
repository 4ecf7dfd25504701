//! Typed events produced by connections, clients and the server.
//!
//! Events from one connection are delivered in the order they happened, on a
//! single FIFO channel. Nothing is guaranteed across connections.
//!
//! Application-facing streams are bounded: when the owner does not drain them,
//! new events are dropped instead of queued, so an application that only reads
//! the mailbox does not accumulate a copy of every message.

use std::io;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::message::MessageContainer;

/// Platform-independent classification of socket failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorKind {
    /// Operation timed out.
    Timeout,
    /// Peer refused the connection.
    Refused,
    /// Connection reset or aborted by the peer.
    Reset,
    /// Anything else.
    Unknown,
}

impl From<io::ErrorKind> for SocketErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Reset,
            _ => Self::Unknown,
        }
    }
}

impl From<&io::Error> for SocketErrorKind {
    fn from(err: &io::Error) -> Self {
        err.kind().into()
    }
}

/// Event surface of the transport.
#[derive(Debug, Clone)]
pub enum Event {
    /// Client connected to its server.
    ConnectedToServer { peer: SocketAddr },
    /// Client connect attempt failed or timed out.
    ConnectionFailed { kind: SocketErrorKind, reason: String },
    /// Server accepted a connection.
    ClientConnected { peer: SocketAddr },
    /// A message was fully reassembled.
    MessageReceived(MessageContainer),
    /// A queued message was written; nanosecond timestamps bracket the send.
    MessageSent { start_ns: u64, end_ns: u64 },
    /// A single inbound message was discarded; the connection stays up.
    MalformedMessage { peer: SocketAddr, reason: String },
    /// Socket failed. Terminal for the connection.
    SocketError {
        peer: SocketAddr,
        kind: SocketErrorKind,
        reason: String,
    },
    /// Peer closed the connection. Terminal for the connection.
    SocketDisconnected { peer: SocketAddr },
    /// Heartbeat write failed.
    FailedToSendKeepAliveMessage,
    /// Nothing has been read for longer than the inactivity threshold.
    NoIncomingData,
}

impl Event {
    /// Check if this event ends its connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::SocketError { .. } | Event::SocketDisconnected { .. })
    }
}

/// Where a connection delivers its events.
#[derive(Debug, Clone)]
pub enum EventSink {
    /// Every event is kept until read. For internal consumers that always
    /// drain, such as the server's routing task.
    Unbounded(mpsc::UnboundedSender<Event>),
    /// Events that find the queue full are dropped.
    Lossy(mpsc::Sender<Event>),
}

impl EventSink {
    /// Deliver an event. Returns `false` once the receiver is gone.
    pub fn deliver(&self, event: Event) -> bool {
        match self {
            EventSink::Unbounded(tx) => tx.send(event).is_ok(),
            EventSink::Lossy(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    tracing::trace!(?dropped, "Event queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        }
    }
}

impl From<mpsc::UnboundedSender<Event>> for EventSink {
    fn from(tx: mpsc::UnboundedSender<Event>) -> Self {
        EventSink::Unbounded(tx)
    }
}

impl From<mpsc::Sender<Event>> for EventSink {
    fn from(tx: mpsc::Sender<Event>) -> Self {
        EventSink::Lossy(tx)
    }
}
