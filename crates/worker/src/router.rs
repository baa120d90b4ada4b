//! Ordering-key routing.
//!
//! At most one worker owns an ordering key at a time. A worker that leases a
//! message for a key someone else owns parks it in the owner's backlog instead
//! of dispatching it; the owner drains the backlog in lease order before it
//! releases the key.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use courier_core::{LeaseId, OrderingKey};
use courier_messaging::LeasedMessage;

/// Result of routing a freshly leased message.
#[derive(Debug)]
pub enum Route {
    /// The caller may dispatch it (and owns its key, if any, until `next` returns `None`).
    Dispatch(LeasedMessage),
    /// Another worker owns the key; the message joined its backlog.
    Queued,
    /// A redelivery of a message already waiting in the backlog took the old
    /// copy's place; the returned stale copy's lease is gone.
    Superseded(LeasedMessage),
}

#[derive(Debug, Default)]
pub struct KeyRouter {
    owned: Mutex<HashMap<OrderingKey, VecDeque<LeasedMessage>>>,
}

impl KeyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn owned(&self) -> MutexGuard<'_, HashMap<OrderingKey, VecDeque<LeasedMessage>>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn route(&self, leased: LeasedMessage) -> Route {
        let Some(key) = leased.message().ordering_key().cloned() else {
            return Route::Dispatch(leased);
        };

        match self.owned().entry(key) {
            Entry::Occupied(mut backlog) => {
                let backlog = backlog.get_mut();
                let id = leased.message().id();
                match backlog.iter_mut().find(|waiting| waiting.message().id() == id) {
                    Some(stale) => Route::Superseded(std::mem::replace(stale, leased)),
                    None => {
                        backlog.push_back(leased);
                        Route::Queued
                    }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Route::Dispatch(leased)
            }
        }
    }

    /// Next backlogged message for a key the caller owns.
    ///
    /// Returns `None` and releases the key once the backlog is empty.
    pub fn next(&self, key: &OrderingKey) -> Option<LeasedMessage> {
        let mut owned = self.owned();
        let backlog = owned.get_mut(key)?;
        match backlog.pop_front() {
            Some(leased) => Some(leased),
            None => {
                owned.remove(key);
                None
            }
        }
    }

    /// Drop a backlogged message whose lease was lost.
    pub fn discard(&self, lease_id: LeaseId) -> Option<LeasedMessage> {
        let mut owned = self.owned();
        owned.values_mut().find_map(|backlog| {
            let idx = backlog
                .iter()
                .position(|waiting| waiting.handle().lease_id() == lease_id)?;
            backlog.remove(idx)
        })
    }

    /// Keys currently owned by some worker.
    pub fn active_keys(&self) -> usize {
        self.owned().len()
    }

    /// Messages waiting behind an owned key.
    pub fn backlog_len(&self) -> usize {
        self.owned().values().map(VecDeque::len).sum()
    }
}
