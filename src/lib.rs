//! # igtlink-transport
//!
//! TCP transport for OpenIGTLink-style device messaging.
//!
//! Messages are a fixed-size header followed by a body whose length the
//! header declares. This crate turns a TCP byte stream into whole messages,
//! runs the client and server connection lifecycles, and hands assembled
//! messages to consumer threads.
//!
//! ## Architecture
//!
//! - **Connection worker**: one tokio task per socket. It reassembles inbound
//!   bytes, writes batched outbound frames, and runs keep-alive and
//!   inactivity timers.
//! - **Client**: [`ClientController`] dials one server and surfaces events.
//! - **Server**: [`ServerListener`] accepts many peers and routes their
//!   messages by source port into a [`MessageManager`] and optional
//!   per-port consumer channels.
//! - **Codec**: the [`Codec`] trait owns the header format; [`IgtlCodec`] is
//!   the default.
//!
//! ## Example
//!
//! ```ignore
//! use igtlink_transport::{Event, ServerListener};
//!
//! #[tokio::main]
//! async fn main() -> igtlink_transport::Result<()> {
//!     let mut server = ServerListener::bind(18944).await?;
//!     let mailbox = server.manager();
//!
//!     while let Some(event) = server.next_event().await {
//!         if let Event::MessageReceived(container) = event {
//!             println!("{} latency {} ns", container.owner_name(), container.latency());
//!         }
//!         println!("ports with data: {:?}", mailbox.keys());
//!     }
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;

mod client;
mod server;

pub use client::{ClientBuilder, ClientController};
pub use codec::{Codec, IgtlCodec, Message};
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use event::{Event, SocketErrorKind};
pub use message::{MessageContainer, MessageManager};
pub use server::{ServerBuilder, ServerListener, DEFAULT_PORT};
