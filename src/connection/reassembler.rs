//! Byte-stream reassembly.
//!
//! TCP delivers an unbounded stream in arbitrary chunks: one read may hold a
//! partial header, a partial body, several complete messages, or any mix.
//! [`Reassembler`] keeps its state across [`push`](Reassembler::push) calls:
//!
//! - `Idle`: nothing buffered
//! - `HeaderPending`: fewer than `header_size()` header bytes buffered
//! - `BodyPending`: header parsed, body buffer allocated, accumulating
//! - `Aborted`: terminal, every later push is ignored
//!
//! A malformed header, an oversized body or a failed unpack discards only
//! the message in flight and returns to `Idle`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use igtlink_transport::codec::{Codec, IgtlCodec, Message};
//! use igtlink_transport::connection::{Reassembler, ReassemblyState};
//!
//! let codec = Arc::new(IgtlCodec::new());
//! let packed = codec.pack(&Message::new("STRING", "Dev", Bytes::from_static(b"hi"))).unwrap();
//!
//! let mut reassembler = Reassembler::new(codec, "127.0.0.1:18944".parse().unwrap());
//! assert!(reassembler.push(&packed.header).is_empty());
//! assert_eq!(reassembler.state(), ReassemblyState::BodyPending);
//!
//! let done = reassembler.push(&packed.body);
//! assert_eq!(done.len(), 1);
//! assert_eq!(reassembler.state(), ReassemblyState::Idle);
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::clock;
use crate::codec::{Codec, HeaderInfo};
use crate::config::DEFAULT_MAX_BODY_LENGTH;
use crate::error::{Result, TransportError};
use crate::message::MessageContainer;

/// Observable reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// No partial header or body buffered.
    Idle,
    /// Some header bytes received.
    HeaderPending,
    /// Header parsed, body incomplete.
    BodyPending,
    /// Cancelled; no further output.
    Aborted,
}

enum State {
    Idle,
    HeaderPending {
        arrived_at: u64,
    },
    BodyPending {
        header: HeaderInfo,
        body: Vec<u8>,
        expected: usize,
        arrived_at: u64,
    },
    Aborted,
}

/// Per-connection reassembly state machine.
pub struct Reassembler {
    codec: Arc<dyn Codec>,
    /// Partial header bytes.
    header: BytesMut,
    state: State,
    max_body_length: u64,
    peer_host: String,
    peer_port: u16,
}

impl Reassembler {
    /// Create a reassembler for a connection from `peer`.
    pub fn new(codec: Arc<dyn Codec>, peer: SocketAddr) -> Self {
        Self::with_max_body_length(codec, peer, DEFAULT_MAX_BODY_LENGTH)
    }

    /// Create a reassembler with a custom body length bound.
    pub fn with_max_body_length(
        codec: Arc<dyn Codec>,
        peer: SocketAddr,
        max_body_length: u64,
    ) -> Self {
        let header = BytesMut::with_capacity(codec.header_size());
        Self {
            codec,
            header,
            state: State::Idle,
            max_body_length,
            peer_host: peer.ip().to_string(),
            peer_port: peer.port(),
        }
    }

    /// Feed bytes read from the socket.
    ///
    /// Returns one entry per message that finished in this chunk, in
    /// arrival order: `Ok` for a complete message, `Err` for a discarded one.
    /// Returns nothing once aborted.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Result<MessageContainer>> {
        let mut done = Vec::new();
        let header_size = self.codec.header_size();

        while !data.is_empty() {
            let state = std::mem::replace(&mut self.state, State::Idle);
            self.state = match state {
                State::Aborted => {
                    self.state = State::Aborted;
                    break;
                }
                State::Idle => State::HeaderPending {
                    arrived_at: clock::now_nanos(),
                },
                State::HeaderPending { arrived_at } => {
                    let take = (header_size - self.header.len()).min(data.len());
                    self.header.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if self.header.len() < header_size {
                        State::HeaderPending { arrived_at }
                    } else {
                        self.start_body(arrived_at, &mut done)
                    }
                }
                State::BodyPending {
                    header,
                    mut body,
                    expected,
                    arrived_at,
                } => {
                    let take = (expected - body.len()).min(data.len());
                    body.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if body.len() < expected {
                        State::BodyPending {
                            header,
                            body,
                            expected,
                            arrived_at,
                        }
                    } else {
                        done.push(self.finish(&header, body, arrived_at));
                        State::Idle
                    }
                }
            };
        }

        done
    }

    /// Header is complete: parse it and allocate the body buffer.
    fn start_body(&mut self, arrived_at: u64, done: &mut Vec<Result<MessageContainer>>) -> State {
        let parsed = self.codec.parse_header(&self.header);
        self.header.clear();

        let header = match parsed {
            Ok(header) => header,
            Err(e) => {
                done.push(Err(e));
                return State::Idle;
            }
        };

        if header.body_length > self.max_body_length {
            done.push(Err(TransportError::BodyTooLarge {
                length: header.body_length,
                max: self.max_body_length,
            }));
            return State::Idle;
        }

        let length = header.body_length;
        let expected = match usize::try_from(length) {
            Ok(expected) => expected,
            Err(_) => {
                done.push(Err(TransportError::AllocationFailed { length }));
                return State::Idle;
            }
        };

        let mut body = Vec::new();
        if body.try_reserve_exact(expected).is_err() {
            done.push(Err(TransportError::AllocationFailed { length }));
            return State::Idle;
        }

        if expected == 0 {
            done.push(self.finish(&header, body, arrived_at));
            return State::Idle;
        }

        tracing::trace!(
            device_type = %header.device_type,
            body_length = length,
            "Header complete, awaiting body"
        );

        State::BodyPending {
            header,
            body,
            expected,
            arrived_at,
        }
    }

    fn finish(
        &self,
        header: &HeaderInfo,
        body: Vec<u8>,
        arrived_at: u64,
    ) -> Result<MessageContainer> {
        let message = self.codec.unpack(header, Bytes::from(body))?;

        let mut container = MessageContainer::new(message);
        container.set_sender(self.peer_host.clone(), self.peer_port);
        container.set_time_arrived(arrived_at);
        container.set_time_received(clock::now_nanos());
        Ok(container)
    }

    /// Discard all partial state and stop producing output.
    pub fn abort(&mut self) {
        self.header.clear();
        self.state = State::Aborted;
    }

    /// Current state.
    pub fn state(&self) -> ReassemblyState {
        match &self.state {
            State::Idle => ReassemblyState::Idle,
            State::HeaderPending { .. } => ReassemblyState::HeaderPending,
            State::BodyPending { .. } => ReassemblyState::BodyPending,
            State::Aborted => ReassemblyState::Aborted,
        }
    }

    /// Bytes received so far for the message in flight (header included).
    pub fn bytes_received(&self) -> usize {
        match &self.state {
            State::HeaderPending { .. } => self.header.len(),
            State::BodyPending { body, .. } => self.codec.header_size() + body.len(),
            State::Idle | State::Aborted => 0,
        }
    }

    /// Declared body length of the message in flight, once its header parsed.
    pub fn pending_body_length(&self) -> Option<u64> {
        match &self.state {
            State::BodyPending { header, .. } => Some(header.body_length),
            _ => None,
        }
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self.state, State::Aborted)
    }
}
