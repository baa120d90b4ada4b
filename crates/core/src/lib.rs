//! Identifiers and routing tags shared by the courier crates.
//!
//! This crate is **pure** (no IO, no async).

pub mod error;
pub mod id;
pub mod kind;

pub use error::{CoreError, CoreResult};
pub use id::{LeaseId, MessageId, ScopeId};
pub use kind::{MessageKind, OrderingKey};
