use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{LeaseId, MessageId, MessageKind, OrderingKey};

/// A unit of work delivered by a transport.
///
/// Notes:
/// - Owned by the transport; the worker only reads it and issues a disposition.
/// - `attempt` starts at 1 and is incremented by the transport on every redelivery.
/// - `payload` is opaque to the framework; handlers decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    kind: MessageKind,
    payload: JsonValue,
    attempt: u32,
    ordering_key: Option<OrderingKey>,
    enqueued_at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: JsonValue) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            payload,
            attempt: 1,
            ordering_key: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Pin the message to an ordering key.
    pub fn with_ordering_key(mut self, key: impl Into<OrderingKey>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Override the delivery attempt (transports restoring persisted state).
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Record a redelivery. Called by transports, never by handlers.
    pub fn mark_redelivered(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ordering_key(&self) -> Option<&OrderingKey> {
        self.ordering_key.as_ref()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Deserialize the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Opaque handle used to dispose of a leased delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseHandle {
    lease_id: LeaseId,
    message_id: MessageId,
}

impl LeaseHandle {
    pub fn new(lease_id: LeaseId, message_id: MessageId) -> Self {
        Self {
            lease_id,
            message_id,
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// A message together with the lease under which it was delivered.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    message: Message,
    handle: LeaseHandle,
}

impl LeasedMessage {
    pub fn new(message: Message, lease_id: LeaseId) -> Self {
        let handle = LeaseHandle::new(lease_id, message.id());
        Self { message, handle }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn handle(&self) -> &LeaseHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (Message, LeaseHandle) {
        (self.message, self.handle)
    }
}
