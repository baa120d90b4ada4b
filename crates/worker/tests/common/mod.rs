#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::MessageId;
use courier_messaging::{InMemoryTransport, LeaseHandle, LeasedMessage, Transport, TransportError};
use courier_observability::LogFormat;
use courier_worker::{ExecutionScope, HostConfig, Isolation, ScopeError, ScopeProvider};

/// Disposition call observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Acknowledge(MessageId),
    Redeliver(MessageId, Duration),
    DeadLetter(MessageId, String),
}

/// In-memory transport that records every successful disposition call and can
/// fail the next few lease or disposition calls with a connectivity error.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    inner: InMemoryTransport,
    calls: Mutex<Vec<Call>>,
    failing_dispositions: AtomicU32,
    failing_leases: AtomicU32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        Self {
            inner: InMemoryTransport::with_visibility_timeout(timeout),
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &InMemoryTransport {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_next_dispositions(&self, count: u32) {
        self.failing_dispositions.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_leases(&self, count: u32) {
        self.failing_leases.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), TransportError> {
        take_failure(&self.failing_dispositions)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn lease(&self, wait: Duration) -> Result<Option<LeasedMessage>, TransportError> {
        take_failure(&self.failing_leases)?;
        self.inner.lease(wait).await
    }

    async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), TransportError> {
        self.injected_failure()?;
        self.inner.acknowledge(lease).await?;
        self.record(Call::Acknowledge(lease.message_id()));
        Ok(())
    }

    async fn schedule_redelivery(
        &self,
        lease: &LeaseHandle,
        delay: Duration,
    ) -> Result<(), TransportError> {
        self.injected_failure()?;
        self.inner.schedule_redelivery(lease, delay).await?;
        self.record(Call::Redeliver(lease.message_id(), delay));
        Ok(())
    }

    async fn dead_letter(&self, lease: &LeaseHandle, reason: &str) -> Result<(), TransportError> {
        self.injected_failure()?;
        self.inner.dead_letter(lease, reason).await?;
        self.record(Call::DeadLetter(lease.message_id(), reason.to_string()));
        Ok(())
    }

    async fn extend_lease(
        &self,
        lease: &LeaseHandle,
        extension: Duration,
    ) -> Result<(), TransportError> {
        self.inner.extend_lease(lease, extension).await
    }
}

fn take_failure(remaining: &AtomicU32) -> Result<(), TransportError> {
    let taken = remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if taken {
        return Err(TransportError::connectivity("broker unreachable"));
    }
    Ok(())
}

/// Scope provider that counts creations and releases of per-message scopes.
#[derive(Debug, Default)]
pub struct CountingProvider {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
}

impl CountingProvider {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ScopeProvider for CountingProvider {
    fn create(&self, isolation: Isolation) -> Result<ExecutionScope, ScopeError> {
        if isolation == Isolation::PerMessage {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ExecutionScope::new(isolation))
    }

    fn release(&self, _scope: &ExecutionScope) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fast timings so scenarios finish in milliseconds.
pub fn test_config() -> HostConfig {
    courier_observability::init_with(LogFormat::Text);
    HostConfig::default()
        .with_name("test-host")
        .with_worker_count(2)
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(10), Duration::from_secs(1))
        .with_jitter(false)
        .with_lease_wait(Duration::from_millis(20))
        .with_idle_poll(Duration::from_millis(5), Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 5s");
}

/// Resolve `future` or fail the test after five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

pub fn shared<T>(value: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(value))
}
