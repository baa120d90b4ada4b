//! Worker pool / host loop.
//!
//! Each worker cycles `Idle → Leasing → Dispatching → Idle` until stopped.
//!
//! Shutdown runs in two phases:
//! 1. `stop`: no worker starts a new lease; in-flight dispatches keep running
//! 2. `abort` (after `shutdown_grace`): handlers still running are cancelled and
//!    their messages disposed as transient failures
//!
//! A worker reaches `Stopped` only from `Idle`, after its current message is
//! disposed.
//!
//! Every lease the host holds, in flight or waiting behind an ordering key, is
//! renewed every `lease_renewal_interval` until its disposition is applied.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use courier_core::LeaseId;
use courier_messaging::{LeaseHandle, LeasedMessage, Message, Transport, TransportError};

use crate::config::HostConfig;
use crate::dispatcher::{Dispatcher, Disposition};
use crate::error::HostError;
use crate::registry::HandlerRegistry;
use crate::router::{KeyRouter, Route};
use crate::scope::{ScopeManager, ScopeProvider};

/// Observable per-worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Leasing,
    Dispatching,
    Stopped,
}

impl WorkerState {
    /// Whether a worker in this state may move to `next`.
    pub fn allows(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Leasing | Idle | Stopped)
                | (Leasing, Idle | Dispatching)
                | (Dispatching, Dispatching | Idle)
        )
    }
}

/// Host counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub leased: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub transport_errors: u64,
    pub in_flight: usize,
    pub lease_renewals: u64,
    /// Held leases the transport no longer recognised.
    pub leases_lost: u64,
}

/// How a shutdown ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// In-flight work outlived the grace period and was cancelled.
    pub forced: bool,
    pub stats: HostStats,
    pub worker_states: Vec<WorkerState>,
}

/// Doubling delay between `initial` and `max`.
#[derive(Debug, Clone)]
struct PollBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Runtime<T: ?Sized> {
    config: HostConfig,
    transport: Arc<T>,
    registry: HandlerRegistry,
    scopes: ScopeManager,
    dispatcher: Dispatcher,
    router: KeyRouter,
    stats: Arc<Mutex<HostStats>>,
    states: Arc<Mutex<Vec<WorkerState>>>,
    /// Leases owned by this host that are not yet disposed.
    held: Mutex<HashMap<LeaseId, LeaseHandle>>,
    stop: CancellationToken,
    abort: CancellationToken,
    keeper_stop: CancellationToken,
}

/// A configured, not yet running host.
pub struct WorkerHost<T: ?Sized> {
    runtime: Arc<Runtime<T>>,
}

impl<T> WorkerHost<T>
where
    T: Transport + ?Sized + 'static,
{
    /// Validate everything that can fail before the first lease.
    pub fn new(
        config: HostConfig,
        registry: HandlerRegistry,
        provider: Arc<dyn ScopeProvider>,
        transport: Arc<T>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(HostError::EmptyRegistry);
        }
        let scopes = ScopeManager::new(provider)?;
        let dispatcher = Dispatcher::new(config.retry_policy(), config.message_timeout);
        let states = vec![WorkerState::Idle; config.worker_count];

        Ok(Self {
            runtime: Arc::new(Runtime {
                config,
                transport,
                registry,
                scopes,
                dispatcher,
                router: KeyRouter::new(),
                stats: Arc::new(Mutex::new(HostStats::default())),
                states: Arc::new(Mutex::new(states)),
                held: Mutex::new(HashMap::new()),
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                keeper_stop: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.runtime.config
    }

    /// Spawn the worker pool on the current tokio runtime.
    pub fn start(self) -> HostHandle {
        let runtime = self.runtime;
        let mut workers = JoinSet::new();
        for worker in 0..runtime.config.worker_count {
            let span = info_span!("worker", host = %runtime.config.name, worker);
            workers.spawn(Arc::clone(&runtime).worker_loop(worker).instrument(span));
        }
        let mut keeper = JoinSet::new();
        let span = info_span!("lease_keeper", host = %runtime.config.name);
        keeper.spawn(Arc::clone(&runtime).lease_keeper().instrument(span));
        info!(
            host = %runtime.config.name,
            workers = runtime.config.worker_count,
            kinds = runtime.registry.len(),
            "worker host started"
        );

        HostHandle {
            name: runtime.config.name.clone(),
            grace: runtime.config.shutdown_grace,
            stop: runtime.stop.clone(),
            abort: runtime.abort.clone(),
            keeper_stop: runtime.keeper_stop.clone(),
            stats: Arc::clone(&runtime.stats),
            states: Arc::clone(&runtime.states),
            workers,
            keeper,
        }
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until<S>(self, signal: S) -> ShutdownReport
    where
        S: Future<Output = ()>,
    {
        let handle = self.start();
        signal.await;
        handle.shutdown().await
    }
}

impl<T> Runtime<T>
where
    T: Transport + ?Sized,
{
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!("worker started");
        let mut idle = PollBackoff::new(
            self.config.idle_poll_interval,
            self.config.max_idle_poll_interval,
        );

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            self.set_state(worker, WorkerState::Leasing);
            let leased = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.set_state(worker, WorkerState::Idle);
                    break;
                }
                leased = self.transport.lease(self.config.lease_wait) => leased,
            };

            match leased {
                Ok(Some(leased)) => {
                    idle.reset();
                    lock(&self.stats).leased += 1;
                    self.hold(leased.handle());
                    self.route(worker, leased).await;
                    self.set_state(worker, WorkerState::Idle);
                }
                Ok(None) => {
                    self.set_state(worker, WorkerState::Idle);
                    self.pause(idle.next_delay()).await;
                }
                Err(TransportError::Closed) => {
                    warn!("transport closed, worker stopping");
                    self.set_state(worker, WorkerState::Idle);
                    break;
                }
                Err(err) => {
                    lock(&self.stats).transport_errors += 1;
                    let delay = idle.next_delay();
                    error!(error = %err, ?delay, "lease failed");
                    self.set_state(worker, WorkerState::Idle);
                    self.pause(delay).await;
                }
            }
        }

        self.set_state(worker, WorkerState::Stopped);
        debug!("worker stopped");
    }

    /// Sleep unless stop is requested first.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn route(&self, worker: usize, leased: LeasedMessage) {
        let leased = match self.router.route(leased) {
            Route::Dispatch(leased) => leased,
            Route::Queued => {
                debug!("ordering key busy, queued behind its owner");
                return;
            }
            Route::Superseded(stale) => {
                self.unhold(stale.handle().lease_id());
                lock(&self.stats).leases_lost += 1;
                debug!(message_id = %stale.message().id(), "redelivered while backlogged, replaced stale copy");
                return;
            }
        };

        let key = leased.message().ordering_key().cloned();
        self.run_one(worker, leased).await;

        let Some(key) = key else { return };
        while let Some(next) = self.router.next(&key) {
            if self.stop.is_cancelled() {
                self.hand_back(next).await;
            } else {
                self.run_one(worker, next).await;
            }
        }
    }

    async fn run_one(&self, worker: usize, leased: LeasedMessage) {
        self.set_state(worker, WorkerState::Dispatching);
        lock(&self.stats).in_flight += 1;

        let (message, lease) = leased.into_parts();
        debug!(message_id = %message.id(), kind = %message.kind(), attempt = message.attempt(), "dispatching");
        let disposition = self
            .dispatcher
            .process(&message, &self.registry, &self.scopes, &self.abort)
            .await;
        let applied = self.apply(&message, &lease, &disposition).await;
        self.unhold(lease.lease_id());

        let mut stats = lock(&self.stats);
        stats.in_flight = stats.in_flight.saturating_sub(1);
        if applied {
            match disposition {
                Disposition::Acknowledge => stats.acknowledged += 1,
                Disposition::RetryAfter(_) => stats.retried += 1,
                Disposition::DeadLetter(_) => stats.dead_lettered += 1,
            }
        }
    }

    /// Return a backlogged, never-dispatched message to the transport.
    async fn hand_back(&self, leased: LeasedMessage) {
        let (message, lease) = leased.into_parts();
        debug!(message_id = %message.id(), "handing back undispatched message");
        self.apply(&message, &lease, &Disposition::RetryAfter(Duration::ZERO))
            .await;
        self.unhold(lease.lease_id());
    }

    fn hold(&self, lease: &LeaseHandle) {
        lock(&self.held).insert(lease.lease_id(), *lease);
    }

    fn unhold(&self, lease_id: LeaseId) {
        lock(&self.held).remove(&lease_id);
    }

    /// Renew held leases until the workers have stopped.
    async fn lease_keeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.lease_renewal_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; fresh leases need no renewal yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.keeper_stop.cancelled() => break,
                _ = ticker.tick() => self.renew_leases().await,
            }
        }
    }

    async fn renew_leases(&self) {
        let held: Vec<LeaseHandle> = lock(&self.held).values().copied().collect();
        for lease in held {
            match self
                .transport
                .extend_lease(&lease, self.config.lease_extension)
                .await
            {
                Ok(()) => lock(&self.stats).lease_renewals += 1,
                Err(TransportError::LeaseNotFound(lease_id)) => {
                    // Disposed in the meantime, or expired. Only the latter is still held.
                    if lock(&self.held).remove(&lease_id).is_none() {
                        continue;
                    }
                    lock(&self.stats).leases_lost += 1;
                    match self.router.discard(lease_id) {
                        Some(lost) => warn!(
                            message_id = %lost.message().id(),
                            %lease_id,
                            "backlogged lease expired, dropped; the transport redelivers it"
                        ),
                        None => warn!(message_id = %lease.message_id(), %lease_id, "in-flight lease expired"),
                    }
                }
                Err(err) => {
                    lock(&self.stats).transport_errors += 1;
                    warn!(message_id = %lease.message_id(), error = %err, "lease renewal failed");
                }
            }
        }
    }

    /// Issue the disposition, retrying connectivity failures.
    ///
    /// Returns whether the transport accepted it.
    async fn apply(&self, message: &Message, lease: &LeaseHandle, disposition: &Disposition) -> bool {
        let limit = self.config.transport_retry_limit;
        let mut backoff = PollBackoff::new(
            self.config.idle_poll_interval,
            self.config.max_idle_poll_interval,
        );

        for attempt in 1..=limit {
            let result = match disposition {
                Disposition::Acknowledge => self.transport.acknowledge(lease).await,
                Disposition::RetryAfter(delay) => {
                    self.transport.schedule_redelivery(lease, *delay).await
                }
                Disposition::DeadLetter(reason) => self.transport.dead_letter(lease, reason).await,
            };

            match result {
                Ok(()) => {
                    trace!(message_id = %message.id(), disposition = disposition.label(), "disposition applied");
                    return true;
                }
                Err(TransportError::LeaseNotFound(lease_id)) => {
                    warn!(message_id = %message.id(), %lease_id, "lease lost before disposition, message will be redelivered");
                    return false;
                }
                Err(err) if err.is_transient() && attempt < limit => {
                    lock(&self.stats).transport_errors += 1;
                    let delay = backoff.next_delay();
                    warn!(message_id = %message.id(), attempt, ?delay, error = %err, "disposition failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    lock(&self.stats).transport_errors += 1;
                    error!(message_id = %message.id(), disposition = disposition.label(), error = %err, "giving up on disposition");
                    return false;
                }
            }
        }
        false
    }

    fn set_state(&self, worker: usize, state: WorkerState) {
        if let Some(slot) = lock(&self.states).get_mut(worker) {
            debug_assert!(slot.allows(state), "worker {worker}: {slot:?} -> {state:?}");
            trace!(from = ?*slot, to = ?state, "worker state");
            *slot = state;
        }
    }
}

/// Control handle for a running host.
///
/// Dropping it without calling [`shutdown`](Self::shutdown) aborts the workers
/// and the lease keeper.
pub struct HostHandle {
    name: String,
    grace: Duration,
    stop: CancellationToken,
    abort: CancellationToken,
    keeper_stop: CancellationToken,
    stats: Arc<Mutex<HostStats>>,
    states: Arc<Mutex<Vec<WorkerState>>>,
    workers: JoinSet<()>,
    keeper: JoinSet<()>,
}

impl HostHandle {
    pub fn stats(&self) -> HostStats {
        lock(&self.stats).clone()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        lock(&self.states).clone()
    }

    /// Stop leasing without waiting; in-flight work continues.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Stop leasing, let in-flight work finish within the grace period, then
    /// cancel whatever is still running and wait for every worker to stop.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!(host = %self.name, grace = ?self.grace, "shutting down");
        self.stop.cancel();

        let drained = tokio::time::timeout(self.grace, join_all(&mut self.workers))
            .await
            .is_ok();
        if !drained {
            warn!(host = %self.name, "grace period elapsed, cancelling in-flight handlers");
            self.abort.cancel();
            join_all(&mut self.workers).await;
        }
        self.keeper_stop.cancel();
        join_all(&mut self.keeper).await;

        let stats = self.stats();
        info!(host = %self.name, forced = !drained, ?stats, "worker host stopped");
        ShutdownReport {
            forced: !drained,
            stats,
            worker_states: self.worker_states(),
        }
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("name", &self.name)
            .field("states", &self.worker_states())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "worker task failed");
        }
    }
}
