//! Assembled message with provenance metadata.
//!
//! # Example
//!
//! ```
//! use igtlink_transport::message::{MessageContainer, INVALID_PORT};
//!
//! let container = MessageContainer::default();
//! assert!(container.payload().is_none());
//! assert_eq!(container.sender_port(), INVALID_PORT);
//! assert_eq!(container.latency(), 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::Message;

/// Port value of a container whose origin is unknown.
pub const INVALID_PORT: i32 = -1;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One decoded message plus where and when it came from.
///
/// Timestamps are nanoseconds on the process clock ([`crate::clock`]);
/// 0 means unset.
///
/// `Clone` copies every field including [`id`](Self::id): a copy traces the
/// same message. The body is immutable shared bytes, so both copies own it
/// independently.
#[derive(Debug, Clone)]
pub struct MessageContainer {
    payload: Option<Message>,
    owner_name: String,
    sender_host: String,
    sender_port: i32,
    time_created: u64,
    time_arrived: u64,
    time_received: u64,
    id: u64,
}

impl Default for MessageContainer {
    fn default() -> Self {
        Self {
            payload: None,
            owner_name: String::new(),
            sender_host: String::new(),
            sender_port: INVALID_PORT,
            time_created: 0,
            time_arrived: 0,
            time_received: 0,
            id: next_id(),
        }
    }
}

impl MessageContainer {
    /// Wrap a message. `owner_name` and `time_created` are taken from it.
    pub fn new(payload: Message) -> Self {
        Self {
            owner_name: payload.device_name.clone(),
            time_created: payload.timestamp,
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Wrap a message under an explicit owner name.
    pub fn with_owner(payload: Message, owner_name: impl Into<String>) -> Self {
        Self {
            owner_name: owner_name.into(),
            ..Self::new(payload)
        }
    }

    /// Record the originating socket.
    pub fn set_sender(&mut self, host: impl Into<String>, port: u16) {
        self.sender_host = host.into();
        self.sender_port = i32::from(port);
    }

    /// Record when the first header byte was seen.
    pub fn set_time_arrived(&mut self, nanos: u64) {
        self.time_arrived = nanos;
    }

    /// Record when reassembly completed.
    pub fn set_time_received(&mut self, nanos: u64) {
        self.time_received = nanos;
    }

    /// Override the creation time.
    pub fn set_time_created(&mut self, nanos: u64) {
        self.time_created = nanos;
    }

    /// The decoded message, if any.
    #[inline]
    pub fn payload(&self) -> Option<&Message> {
        self.payload.as_ref()
    }

    /// Take ownership of the decoded message.
    pub fn into_payload(self) -> Option<Message> {
        self.payload
    }

    #[inline]
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    #[inline]
    pub fn sender_host(&self) -> &str {
        &self.sender_host
    }

    /// Source port, or [`INVALID_PORT`].
    #[inline]
    pub fn sender_port(&self) -> i32 {
        self.sender_port
    }

    #[inline]
    pub fn time_created(&self) -> u64 {
        self.time_created
    }

    #[inline]
    pub fn time_arrived(&self) -> u64 {
        self.time_arrived
    }

    #[inline]
    pub fn time_received(&self) -> u64 {
        self.time_received
    }

    /// Process-unique trace id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `time_received - time_created` in nanoseconds, 0 if either is unset.
    pub fn latency(&self) -> u64 {
        if self.time_created == 0 || self.time_received == 0 {
            return 0;
        }
        self.time_received.saturating_sub(self.time_created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> MessageContainer {
        let message = Message::new("STRING", "Tracker", Bytes::from_static(b"hello"))
            .with_timestamp(1_000);
        let mut container = MessageContainer::new(message);
        container.set_sender("10.0.0.2", 18944);
        container.set_time_arrived(1_500);
        container.set_time_received(2_000);
        container
    }

    #[test]
    fn test_default_state() {
        let container = MessageContainer::default();
        assert!(container.payload().is_none());
        assert_eq!(container.owner_name(), "");
        assert_eq!(container.sender_host(), "");
        assert_eq!(container.sender_port(), -1);
        assert_eq!(container.time_created(), 0);
        assert_eq!(container.time_arrived(), 0);
        assert_eq!(container.time_received(), 0);
        assert_eq!(container.latency(), 0);
    }

    #[test]
    fn test_ids_increase() {
        let a = MessageContainer::default();
        let b = MessageContainer::default();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_new_takes_owner_and_creation_time() {
        let container = sample();
        assert_eq!(container.owner_name(), "Tracker");
        assert_eq!(container.time_created(), 1_000);
        assert_eq!(container.sender_host(), "10.0.0.2");
        assert_eq!(container.sender_port(), 18944);
        assert_eq!(container.latency(), 1_000);
    }

    #[test]
    fn test_with_owner() {
        let message = Message::new("STRING", "Tracker", Bytes::new());
        let container = MessageContainer::with_owner(message, "Console");
        assert_eq!(container.owner_name(), "Console");
    }

    #[test]
    fn test_latency_zero_when_unset() {
        let mut container = sample();
        container.set_time_received(0);
        assert_eq!(container.latency(), 0);

        let mut container = sample();
        container.set_time_created(0);
        assert_eq!(container.latency(), 0);
    }

    #[test]
    fn test_latency_saturates_on_skew() {
        let mut container = sample();
        container.set_time_created(5_000);
        assert_eq!(container.latency(), 0);
    }

    #[test]
    fn test_clone_reproduces_every_field() {
        let original = sample();
        let copy = original.clone();

        assert_eq!(copy.owner_name(), original.owner_name());
        assert_eq!(copy.sender_host(), original.sender_host());
        assert_eq!(copy.sender_port(), original.sender_port());
        assert_eq!(copy.time_created(), original.time_created());
        assert_eq!(copy.time_arrived(), original.time_arrived());
        assert_eq!(copy.time_received(), original.time_received());
        assert_eq!(copy.id(), original.id());
        assert_eq!(copy.payload(), original.payload());
    }

    #[test]
    fn test_clone_assignment_replaces_state() {
        let source = sample();
        let mut target = MessageContainer::default();
        target.clone_from(&source);

        assert_eq!(target.owner_name(), "Tracker");
        assert_eq!(target.sender_port(), 18944);
        assert_eq!(target.payload().map(|m| &m.body[..]), Some(&b"hello"[..]));

        // The copy owns its payload independently
        drop(source);
        assert_eq!(target.into_payload().unwrap().body, Bytes::from_static(b"hello"));
    }
}
