//! Message module - assembled messages and the cross-thread mailbox.
//!
//! - [`MessageContainer`] - a decoded message plus provenance and timing
//! - [`MessageManager`] - latest-value-per-key handoff between tasks/threads

mod container;
mod manager;

pub use container::{MessageContainer, INVALID_PORT};
pub use manager::MessageManager;
