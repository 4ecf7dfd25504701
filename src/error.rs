//! Error types for igtlink-transport.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Header bytes could not be parsed by the codec.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Body bytes could not be unpacked by the codec.
    #[error("Malformed body: {0}")]
    MalformedBody(String),

    /// Declared body length exceeds the configured bound.
    #[error("Body length {length} exceeds maximum {max}")]
    BodyTooLarge { length: u64, max: u64 },

    /// Body buffer could not be allocated.
    #[error("Cannot allocate body buffer of {length} bytes")]
    AllocationFailed { length: u64 },

    /// Body checksum does not match the header.
    #[error("CRC mismatch: header says {expected:#018x}, body has {actual:#018x}")]
    CrcMismatch { expected: u64, actual: u64 },

    /// Connect attempt did not finish in time.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Operation requires a live connection.
    #[error("Not connected")]
    NotConnected,

    /// `connect_to_host` called while a connection is live.
    #[error("Already connected")]
    AlreadyConnected,

    /// Connection closed while an operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue is full.
    #[error("Outbound queue full")]
    ChannelFull,

    /// No accepted connection originates from the given port.
    #[error("No connection from port {0}")]
    UnknownPeer(i32),
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
