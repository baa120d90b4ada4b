//! Handler interface implemented by message consumers.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_messaging::Message;

use crate::policy::FailureClass;
use crate::scope::ExecutionScope;

/// Failure reported by a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The handler stopped because its cancellation token fired.
    #[error("cancelled before completion")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Default classification: only explicit `Permanent` errors skip retries.
    pub fn default_class(&self) -> FailureClass {
        match self {
            HandlerError::Permanent(_) => FailureClass::Permanent,
            HandlerError::Transient(_) | HandlerError::Cancelled | HandlerError::Other(_) => {
                FailureClass::Transient
            }
        }
    }
}

/// A payload that does not decode will not decode on the next attempt either.
impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Permanent(format!("malformed payload: {value}"))
    }
}

/// Processing entry point for one message kind.
///
/// ## Contract
///
/// - **Idempotent**: delivery is at-least-once; the same message may be handled twice
/// - **Cooperative cancellation**: long operations must watch `cancel` and return
///   promptly once it fires. The host cannot preempt a handler that ignores it; it
///   only stops awaiting the handler and disposes of the message
/// - **Shared handlers** are invoked concurrently by every worker and must
///   synchronize their own mutable state
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        scope: &ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;

    /// Map an error to a failure class. Override for domain-specific rules.
    fn classify(&self, error: &HandlerError) -> FailureClass {
        error.default_class()
    }
}
