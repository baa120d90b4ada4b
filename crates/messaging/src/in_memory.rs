//! In-memory transport for tests/dev.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use courier_core::{LeaseId, MessageId};

use crate::message::{LeaseHandle, LeasedMessage, Message};
use crate::transport::{Transport, TransportError};

/// Default lease visibility timeout.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A message that was moved to the dead-letter list.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub message: Message,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveLease {
    id: LeaseId,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entry {
    message: Message,
    visible_at: Instant,
    lease: Option<ActiveLease>,
}

#[derive(Debug, Default)]
struct State {
    /// Enqueue order; leasing always picks the first visible entry.
    entries: VecDeque<Entry>,
    dead_letters: Vec<DeadLetterRecord>,
    closed: bool,
}

impl State {
    /// Expired leases make their message visible again as a new delivery.
    fn reclaim_expired(&mut self, now: Instant) {
        for entry in &mut self.entries {
            let expired = entry.lease.as_ref().is_some_and(|l| l.expires_at <= now);
            if expired {
                entry.lease = None;
                entry.visible_at = now;
                entry.message.mark_redelivered();
                debug!(message_id = %entry.message.id(), "lease expired, message visible again");
            }
        }
    }

    fn try_lease(&mut self, now: Instant, visibility_timeout: Duration) -> Option<LeasedMessage> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.lease.is_none() && e.visible_at <= now)?;

        let lease_id = LeaseId::new();
        entry.lease = Some(ActiveLease {
            id: lease_id,
            expires_at: now + visibility_timeout,
        });
        Some(LeasedMessage::new(entry.message.clone(), lease_id))
    }

    /// Earliest instant at which something may become leasable.
    fn next_wakeup(&self) -> Option<Instant> {
        self.entries
            .iter()
            .map(|e| match &e.lease {
                Some(lease) => lease.expires_at,
                None => e.visible_at,
            })
            .min()
    }

    fn position(&self, lease: &LeaseHandle) -> Result<usize, TransportError> {
        self.entries
            .iter()
            .position(|e| e.lease.as_ref().is_some_and(|l| l.id == lease.lease_id()))
            .ok_or(TransportError::LeaseNotFound(lease.lease_id()))
    }
}

/// In-process queue with lease semantics.
///
/// - Leases expire after the visibility timeout (at-least-once redelivery)
/// - Redelivery keeps the message's queue position and bumps its attempt
/// - Dead letters are retained for inspection and can be requeued
#[derive(Debug)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message to the queue; it is visible immediately.
    pub fn enqueue(&self, message: Message) -> MessageId {
        let id = message.id();
        self.state().entries.push_back(Entry {
            message,
            visible_at: Instant::now(),
            lease: None,
        });
        self.notify.notify_waiters();
        id
    }

    /// Messages not currently leased (visible now or scheduled for later).
    pub fn pending_len(&self) -> usize {
        self.state()
            .entries
            .iter()
            .filter(|e| e.lease.is_none())
            .count()
    }

    /// Messages currently held under a lease.
    pub fn in_flight_len(&self) -> usize {
        self.state()
            .entries
            .iter()
            .filter(|e| e.lease.is_some())
            .count()
    }

    /// Whether no message is pending or in flight.
    pub fn is_drained(&self) -> bool {
        self.state().entries.is_empty()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state().dead_letters.clone()
    }

    /// Move a dead-lettered message back to the queue as a fresh first attempt.
    pub fn requeue_dead_letter(&self, message_id: MessageId) -> Result<(), TransportError> {
        let mut state = self.state();
        let idx = state
            .dead_letters
            .iter()
            .position(|r| r.message.id() == message_id)
            .ok_or(TransportError::MessageNotFound(message_id))?;

        let record = state.dead_letters.remove(idx);
        state.entries.push_back(Entry {
            message: record.message.with_attempt(1),
            visible_at: Instant::now(),
            lease: None,
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Refuse further leases; waiting `lease` calls return `TransportError::Closed`.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn lease(&self, wait: Duration) -> Result<Option<LeasedMessage>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before inspecting state so an enqueue between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state();
                if state.closed {
                    return Err(TransportError::Closed);
                }

                let now = Instant::now();
                state.reclaim_expired(now);
                if let Some(leased) = state.try_lease(now, self.visibility_timeout) {
                    return Ok(Some(leased));
                }

                state
                    .next_wakeup()
                    .map_or(deadline, |at| at.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        let idx = state.position(lease)?;
        state.entries.remove(idx);
        Ok(())
    }

    async fn schedule_redelivery(
        &self,
        lease: &LeaseHandle,
        delay: Duration,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            let idx = state.position(lease)?;
            let entry = &mut state.entries[idx];
            entry.lease = None;
            entry.visible_at = Instant::now() + delay;
            entry.message.mark_redelivered();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_lease(
        &self,
        lease: &LeaseHandle,
        extension: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let now = Instant::now();
        // An expired lease may not have been reclaimed yet; it must not be revived.
        state.reclaim_expired(now);
        let idx = state.position(lease)?;
        if let Some(active) = state.entries[idx].lease.as_mut() {
            active.expires_at = now + extension;
        }
        Ok(())
    }

    async fn dead_letter(&self, lease: &LeaseHandle, reason: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        let idx = state.position(lease)?;
        if let Some(entry) = state.entries.remove(idx) {
            state.dead_letters.push(DeadLetterRecord {
                message: entry.message,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
        }
        Ok(())
    }
}
