//! Connection module - stream reassembly and the per-socket I/O loop.
//!
//! - [`Reassembler`] - synchronous state machine turning byte chunks into messages
//! - [`ConnectionWorker`] - task owning one socket's reads and heartbeats
//! - [`WorkerHandle`] - owner side of a running worker (send, abort)
//! - [`OutboundFrame`] / [`write_batch`] - batched vectored writes, run on a
//!   dedicated writer task per connection

mod reassembler;
mod worker;
mod writer;

pub use reassembler::{ReassemblyState, Reassembler};
pub use worker::{spawn_tcp_worker, spawn_worker, ConnectionWorker, Role, WorkerHandle};
pub use writer::{write_batch, OutboundFrame, MAX_BATCH_SIZE};
