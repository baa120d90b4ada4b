//! Messages and the transport seam.
//!
//! The transport (queue/topic client) is an external collaborator: this crate
//! only defines the contract the worker host consumes, plus an in-memory
//! implementation for tests and local runs.

pub mod in_memory;
pub mod message;
pub mod transport;

pub use in_memory::{DeadLetterRecord, InMemoryTransport};
pub use message::{LeaseHandle, LeasedMessage, Message};
pub use transport::{Transport, TransportError};
