//! Transport abstraction (queue/topic client, consumed as an interface).
//!
//! ## Delivery model
//!
//! - **Leases**: a delivered message stays invisible to other consumers until it
//!   is disposed or its lease expires
//! - **At-least-once**: an expired lease makes the message visible again, so
//!   handlers must be idempotent
//! - **Terminal disposition**: every lease ends in exactly one of
//!   `acknowledge`, `schedule_redelivery` or `dead_letter`
//! - **Renewal**: a consumer holding a message longer than the visibility
//!   timeout keeps it with `extend_lease`
//!
//! Key-based ordering, partition rebalancing and leader election belong to the
//! transport; the worker host only preserves what the transport provides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{LeaseId, MessageId};

use crate::message::{LeaseHandle, LeasedMessage};

/// Transport call failures.
///
/// These are never message-level failures: the host retries the transport
/// call itself (or abandons a lost lease) instead of touching the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Transient connectivity failure; the call may be retried.
    #[error("transport connectivity error: {0}")]
    Connectivity(String),

    /// The lease expired or was already disposed; the message belongs to
    /// another delivery now.
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    /// No dead-lettered message with this id exists.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Connectivity(_))
    }
}

/// Queue client consumed by the worker host.
///
/// Implementations must be safe for concurrent use by every worker in the pool
/// (or be pooled one-per-worker behind this trait).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait up to `wait` for the next visible message and lease it.
    ///
    /// `Ok(None)` means nothing became available within the wait. Must be
    /// cancel-safe: the host drops a pending call when it stops.
    async fn lease(&self, wait: Duration) -> Result<Option<LeasedMessage>, TransportError>;

    /// The message was processed; remove it for good.
    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), TransportError>;

    /// Release the lease and make the message visible again after `delay`.
    /// The redelivered message carries an incremented attempt count.
    async fn schedule_redelivery(
        &self,
        lease: &LeaseHandle,
        delay: Duration,
    ) -> Result<(), TransportError>;

    /// Durably move the message to the dead-letter destination with `reason` attached.
    async fn dead_letter(&self, lease: &LeaseHandle, reason: &str) -> Result<(), TransportError>;

    /// Keep the message invisible for `extension` from now.
    ///
    /// Fails with `LeaseNotFound` once the lease has expired or been disposed.
    async fn extend_lease(
        &self,
        lease: &LeaseHandle,
        extension: Duration,
    ) -> Result<(), TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn lease(&self, wait: Duration) -> Result<Option<LeasedMessage>, TransportError> {
        (**self).lease(wait).await
    }

    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), TransportError> {
        (**self).acknowledge(lease).await
    }

    async fn schedule_redelivery(
        &self,
        lease: &LeaseHandle,
        delay: Duration,
    ) -> Result<(), TransportError> {
        (**self).schedule_redelivery(lease, delay).await
    }

    async fn dead_letter(&self, lease: &LeaseHandle, reason: &str) -> Result<(), TransportError> {
        (**self).dead_letter(lease, reason).await
    }

    async fn extend_lease(
        &self,
        lease: &LeaseHandle,
        extension: Duration,
    ) -> Result<(), TransportError> {
        (**self).extend_lease(lease, extension).await
    }
}
