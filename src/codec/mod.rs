//! Codec boundary - header parsing and body (un)packing.
//!
//! The transport never interprets header bytes itself. It asks a [`Codec`]
//! how large the fixed header is, what body length and device type a header
//! declares, and how to turn the body bytes into a [`Message`].
//!
//! - [`Codec`] - the boundary trait, shared as `Arc<dyn Codec>`
//! - [`IgtlCodec`] - default 58-byte OpenIGTLink-style header with CRC-64
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use igtlink_transport::codec::{Codec, IgtlCodec, Message};
//!
//! let codec = IgtlCodec::new();
//! let packed = codec.pack(&Message::new("STRING", "Tracker", Bytes::from_static(b"ok"))).unwrap();
//!
//! let header = codec.parse_header(&packed.header).unwrap();
//! assert_eq!(header.device_type, "STRING");
//! assert_eq!(header.body_length, 2);
//!
//! let message = codec.unpack(&header, packed.body).unwrap();
//! assert_eq!(&message.body[..], b"ok");
//! ```

mod igtl;

use bytes::Bytes;

use crate::error::Result;

pub use igtl::{
    IgtlCodec, DEVICE_NAME_SIZE, DEVICE_TYPE_SIZE, HEADER_SIZE, IGTL_VERSION, MAX_IGTL_VERSION,
};

/// Device type carried by heartbeat messages.
pub const KEEP_ALIVE_TYPE: &str = "KEEPALIVE";

/// Fields a codec extracts from a fixed-size header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Protocol version of the header.
    pub version: u16,
    /// Message type tag (e.g. `TRANSFORM`, `IMAGE`).
    pub device_type: String,
    /// Logical sender name.
    pub device_name: String,
    /// Creation time, nanoseconds since the Unix epoch (0 = unset).
    pub timestamp: u64,
    /// Declared body length in bytes.
    pub body_length: u64,
    /// Body checksum as declared by the sender.
    pub crc: u64,
}

/// A decoded protocol message.
///
/// The body is opaque to the transport and shared via `bytes::Bytes`, so
/// cloning a message never copies body data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version.
    pub version: u16,
    /// Message type tag.
    pub device_type: String,
    /// Logical sender name.
    pub device_name: String,
    /// Creation time, nanoseconds since the Unix epoch (0 = stamp on pack).
    pub timestamp: u64,
    /// Type-specific body bytes.
    pub body: Bytes,
}

impl Message {
    /// Create a message. The timestamp is left unset and filled in on pack.
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Self {
            version: IGTL_VERSION,
            device_type: device_type.into(),
            device_name: device_name.into(),
            timestamp: 0,
            body,
        }
    }

    /// Create a header-only heartbeat.
    pub fn keep_alive(device_name: impl Into<String>) -> Self {
        Self::new(KEEP_ALIVE_TYPE, device_name, Bytes::new())
    }

    /// Set an explicit creation timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check if this is a heartbeat.
    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.device_type == KEEP_ALIVE_TYPE
    }
}

/// Header and body ready to be written to a socket.
#[derive(Debug, Clone)]
pub struct PackedMessage {
    /// Encoded fixed-size header.
    pub header: Bytes,
    /// Body bytes (shared with the source message).
    pub body: Bytes,
}

impl PackedMessage {
    /// Total encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// Protocol codec used by the transport.
///
/// Implementations must be stateless or internally synchronized; one codec
/// instance is shared by every connection.
pub trait Codec: Send + Sync + 'static {
    /// Size of the fixed header in bytes.
    fn header_size(&self) -> usize;

    /// Parse a complete header. `bytes` is exactly `header_size()` long.
    fn parse_header(&self, bytes: &[u8]) -> Result<HeaderInfo>;

    /// Turn a complete body into a message.
    fn unpack(&self, header: &HeaderInfo, body: Bytes) -> Result<Message>;

    /// Encode a message for the wire.
    fn pack(&self, message: &Message) -> Result<PackedMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_new_leaves_timestamp_unset() {
        let message = Message::new("STATUS", "Device", Bytes::from_static(b"x"));
        assert_eq!(message.timestamp, 0);
        assert_eq!(message.version, IGTL_VERSION);
        assert!(!message.is_keep_alive());
    }

    #[test]
    fn test_keep_alive_is_header_only() {
        let message = Message::keep_alive("Client");
        assert!(message.is_keep_alive());
        assert!(message.body.is_empty());
        assert_eq!(message.device_name, "Client");
    }

    #[test]
    fn test_packed_size() {
        let packed = PackedMessage {
            header: Bytes::from_static(&[0u8; HEADER_SIZE]),
            body: Bytes::from_static(b"abc"),
        };
        assert_eq!(packed.size(), HEADER_SIZE + 3);
    }
}
