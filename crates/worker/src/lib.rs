//! Scoped background message processing.
//!
//! - `registry`: message kind → handler descriptor
//! - `scope`: per-message / shared dependency scopes with guaranteed release
//! - `dispatcher`: one message through one handler, bounded by deadline and abort
//! - `policy`: retry / dead-letter decision and backoff
//! - `host`: fixed worker pool with graceful shutdown

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod host;
pub mod policy;
pub mod registry;
pub mod router;
pub mod scope;

pub use config::{ConfigError, HostConfig};
pub use dispatcher::{Dispatcher, Disposition};
pub use error::HostError;
pub use handler::{HandlerError, MessageHandler};
pub use host::{HostHandle, HostStats, ShutdownReport, WorkerHost, WorkerState};
pub use policy::{Decision, FailureClass, RetryPolicy, decide};
pub use registry::{HandlerDescriptor, HandlerFactory, HandlerRegistry, RegistryError};
pub use router::{KeyRouter, Route};
pub use scope::{ExecutionScope, Isolation, ScopeError, ScopeLease, ScopeManager, ScopeProvider};

pub use tokio_util::sync::CancellationToken;
