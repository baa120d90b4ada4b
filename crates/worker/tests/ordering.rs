mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{MessageId, MessageKind, OrderingKey};
use courier_messaging::Message;
use courier_worker::{
    CancellationToken, ExecutionScope, HandlerDescriptor, HandlerError, HandlerRegistry,
    MessageHandler, WorkerHost,
};
use proptest::prelude::*;
use serde_json::json;

use common::{Call, CountingProvider, RecordingTransport, test_config, wait_until, within};

/// Records whether two messages with the same ordering key ever ran at once.
#[derive(Default)]
struct OverlapDetector {
    active: Mutex<HashSet<OrderingKey>>,
    overlapped: AtomicBool,
    handled: AtomicUsize,
}

#[async_trait]
impl MessageHandler for OverlapDetector {
    async fn handle(
        &self,
        message: &Message,
        _scope: &ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let Some(key) = message.ordering_key().cloned() else {
            self.handled.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        if !self.active.lock().unwrap().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let pause: u64 = message.decode_payload()?;
        tokio::time::sleep(Duration::from_millis(pause)).await;
        self.active.lock().unwrap().remove(&key);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_keyed(messages: Vec<(Option<u8>, u64)>, workers: usize) -> (bool, usize) {
    let transport = Arc::new(RecordingTransport::new());
    let detector = Arc::new(OverlapDetector::default());
    let handler = detector.clone();
    let kind = MessageKind::new("keyed").unwrap();
    let registry = HandlerRegistry::new()
        .with(HandlerDescriptor::shared(kind.clone(), move |_| Ok(handler.clone())))
        .unwrap();

    let total = messages.len();
    for (key, pause) in messages {
        let mut message = Message::new(kind.clone(), json!(pause));
        if let Some(key) = key {
            message = message.with_ordering_key(format!("account-{key}").as_str());
        }
        transport.inner().enqueue(message);
    }

    let host = WorkerHost::new(
        test_config().with_worker_count(workers),
        registry,
        Arc::new(CountingProvider::default()),
        transport.clone(),
    )
    .unwrap();
    let handle = host.start();
    wait_until(|| detector.handled.load(Ordering::SeqCst) == total).await;
    wait_until(|| transport.inner().is_drained()).await;
    within(handle.shutdown()).await;

    (detector.overlapped.load(Ordering::SeqCst), total)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_messages_never_overlap() {
    let messages = (0..40u64)
        .map(|i| (Some((i % 3) as u8), 1 + i % 4))
        .collect();
    let (overlapped, _) = run_keyed(messages, 4).await;
    assert!(!overlapped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unkeyed_messages_spread_across_workers() {
    let messages = (0..20u64).map(|_| (None, 0)).collect();
    let (overlapped, total) = run_keyed(messages, 4).await;
    assert!(!overlapped);
    assert_eq!(total, 20);
}

/// Records the attempt number of every delivery it handles.
#[derive(Default)]
struct AttemptLog {
    seen: Mutex<HashMap<MessageId, Vec<u32>>>,
}

#[async_trait]
impl MessageHandler for AttemptLog {
    async fn handle(
        &self,
        message: &Message,
        _scope: &ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .entry(message.id())
            .or_default()
            .push(message.attempt());
        tokio::time::sleep(Duration::from_millis(90)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backlogged_messages_keep_their_lease_past_the_visibility_timeout() {
    let transport = Arc::new(RecordingTransport::with_visibility_timeout(Duration::from_millis(
        100,
    )));
    let log = Arc::new(AttemptLog::default());
    let handler = log.clone();
    let kind = MessageKind::new("ledger.post").unwrap();
    let registry = HandlerRegistry::new()
        .with(HandlerDescriptor::shared(kind.clone(), move |_| Ok(handler.clone())))
        .unwrap();

    let ids: Vec<MessageId> = (0..3)
        .map(|n| {
            transport
                .inner()
                .enqueue(Message::new(kind.clone(), json!({ "n": n })).with_ordering_key("acct"))
        })
        .collect();

    // The third message waits ~180ms behind the other two, well past the
    // 100ms visibility timeout.
    let config = test_config()
        .with_worker_count(2)
        .with_lease_renewal(Duration::from_millis(20), Duration::from_millis(300));
    let host = WorkerHost::new(
        config,
        registry,
        Arc::new(CountingProvider::default()),
        transport.clone(),
    )
    .unwrap();
    let handle = host.start();
    wait_until(|| transport.inner().is_drained()).await;
    let report = within(handle.shutdown()).await;

    let seen = log.seen.lock().unwrap().clone();
    for id in &ids {
        assert_eq!(seen.get(id), Some(&vec![1]), "message {id} handled more than once");
    }
    // Acknowledged once each; the order depends on which worker routed first.
    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    for id in &ids {
        assert!(calls.contains(&Call::Acknowledge(*id)), "{calls:?}");
    }
    assert_eq!(report.stats.acknowledged, 3);
    assert_eq!(report.stats.leases_lost, 0);
    assert!(report.stats.lease_renewals > 0);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 12, ..ProptestConfig::default() })]

    /// Property: whatever the mix of keys, pauses and pool size, messages
    /// sharing an ordering key are never dispatched concurrently.
    #[test]
    fn keyed_dispatch_is_exclusive(
        messages in prop::collection::vec((prop::option::of(0u8..4), 0u64..4), 1..30),
        workers in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (overlapped, _) = runtime.block_on(run_keyed(messages, workers));
        prop_assert!(!overlapped);
    }
}
