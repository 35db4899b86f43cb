//! End-to-end dispatch pipeline over the in-memory store and the in-process
//! transport: deterministic coverage of the delivery state machine —
//! retry-then-dispatch, dead-lettering, per-topic ordering, crash recovery
//! with idempotent redelivery.

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use telemetry_core::bus::{Dispatcher, EventTransport, InProcessTransport};
use telemetry_core::{
    DispatchSettings, EventBus, EventBusSettings, EventDelivery, EventHandler, HandlerError,
    IdempotentHandler, MemoryOutboxStore, OutboxEvent, OutboxStatus, OutboxStore,
    SubscriptionRegistry,
};

fn fast_dispatch() -> DispatchSettings {
    DispatchSettings {
        workers: 2,
        poll_interval_ms: 5,
        batch_size: 16,
        attempt_timeout_ms: 1_000,
        max_attempts: 5,
        backoff_base_ms: 0,
        backoff_max_ms: 0,
        claim_lease_secs: 60,
    }
}

/// Handler that fails its first `failures` deliveries, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl EventHandler for Flaky {
    async fn handle(&self, _delivery: &EventDelivery) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(HandlerError::new(format!("induced failure {call}")))
        } else {
            Ok(())
        }
    }
}

/// Handler that records the order payloads arrive in.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError> {
        let n = delivery.payload["n"]
            .as_i64()
            .ok_or_else(|| HandlerError::new("missing n"))?;
        self.seen.lock().await.push((delivery.topic.clone(), n));
        Ok(())
    }
}

struct Pipeline {
    store: MemoryOutboxStore,
    dispatcher: Dispatcher,
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<InProcessTransport>,
}

async fn pipeline() -> Pipeline {
    let store = MemoryOutboxStore::new();
    let transport = Arc::new(InProcessTransport::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let dispatcher = Dispatcher::new(
        Arc::new(store.clone()),
        transport.clone(),
        fast_dispatch(),
    );
    Pipeline {
        store,
        dispatcher,
        registry,
        transport,
    }
}

fn event(topic: &str, n: i64) -> telemetry_core::OutboxRecord {
    OutboxEvent::new(topic, &serde_json::json!({ "n": n }))
        .unwrap()
        .into_record()
}

/// Drive `run_once` until nothing is claimable, bounded by `rounds`.
async fn drain(dispatcher: &Dispatcher, rounds: usize) {
    for _ in 0..rounds {
        dispatcher.run_once("test-worker").await.unwrap();
    }
}

#[tokio::test]
async fn two_failures_then_success_dispatches_with_three_attempts() {
    let p = pipeline().await;
    let handler = Flaky::new(2);
    p.registry.subscribe("alerts.raised", handler.clone()).unwrap();
    p.transport.start(p.registry.clone()).await.unwrap();

    let record = event("alerts.raised", 1);
    let id = record.id;
    p.store.enqueue(record).await.unwrap();

    drain(&p.dispatcher, 5).await;

    let record = p.store.record(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Dispatched);
    assert_eq!(record.attempts, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(p.store.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn five_failures_with_cap_five_dead_letters_the_record() {
    let p = pipeline().await;
    let handler = Flaky::new(u32::MAX);
    p.registry.subscribe("alerts.raised", handler.clone()).unwrap();
    p.transport.start(p.registry.clone()).await.unwrap();

    let record = event("alerts.raised", 1);
    let id = record.id;
    p.store.enqueue(record).await.unwrap();

    drain(&p.dispatcher, 8).await;

    let record = p.store.record(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::DeadLettered);
    assert_eq!(record.attempts, 5);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    assert!(record.last_error.is_some());

    // Dead-lettered records stay visible to operators.
    let letters = p.store.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
}

#[tokio::test]
async fn same_topic_events_arrive_in_creation_order() {
    let p = pipeline().await;
    let recorder = Arc::new(Recorder::default());
    p.registry.subscribe(">", recorder.clone()).unwrap();
    p.transport.start(p.registry.clone()).await.unwrap();

    for n in 1..=5 {
        p.store.enqueue(event("meter.readings", n)).await.unwrap();
    }
    p.store.enqueue(event("other.topic", 100)).await.unwrap();

    // One record per topic per cycle: six cycles drain everything.
    drain(&p.dispatcher, 6).await;

    let seen = recorder.seen.lock().await;
    let meter: Vec<i64> = seen
        .iter()
        .filter(|(topic, _)| topic == "meter.readings")
        .map(|(_, n)| *n)
        .collect();
    assert_eq!(meter, vec![1, 2, 3, 4, 5]);
    assert!(seen.iter().any(|(topic, _)| topic == "other.topic"));
    assert_eq!(
        p.store.count_in_status(OutboxStatus::Dispatched).await,
        6
    );
}

#[tokio::test]
async fn a_retrying_topic_does_not_block_other_topics() {
    let p = pipeline().await;
    let stuck = Flaky::new(u32::MAX);
    let recorder = Arc::new(Recorder::default());
    p.registry.subscribe("stuck.topic", stuck).unwrap();
    p.registry.subscribe("healthy.topic", recorder.clone()).unwrap();
    p.transport.start(p.registry.clone()).await.unwrap();

    p.store.enqueue(event("stuck.topic", 1)).await.unwrap();
    p.store.enqueue(event("healthy.topic", 2)).await.unwrap();

    drain(&p.dispatcher, 3).await;

    assert_eq!(recorder.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn crash_before_ack_redelivers_and_idempotency_suppresses_the_effect() {
    let p = pipeline().await;

    // `observer` counts raw deliveries; `effect` counts the domain effect
    // behind the idempotency window.
    let observer = Flaky::new(0);
    let effect = Flaky::new(0);
    p.registry.subscribe("device.created", observer.clone()).unwrap();
    p.registry
        .subscribe(
            "device.created",
            Arc::new(IdempotentHandler::new(effect.clone(), 64)),
        )
        .unwrap();
    p.transport.start(p.registry.clone()).await.unwrap();

    let record = event("device.created", 7);
    let id = record.id;
    p.store.enqueue(record).await.unwrap();

    // A worker claims and delivers, then crashes before committing the
    // status transition.
    let claim = p
        .store
        .claim_due("doomed-worker", Utc::now(), 1)
        .await
        .unwrap()
        .remove(0);
    let delivery = EventDelivery {
        record_id: claim.record.id,
        topic: claim.record.topic.clone(),
        payload: claim.record.payload.clone(),
        attempt: 1,
    };
    p.transport.publish(&delivery).await.unwrap();
    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);

    // Restart path: the abandoned claim expires and the record is
    // reprocessed.
    let released = p
        .store
        .recover_expired_claims(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(released, 1);

    drain(&p.dispatcher, 3).await;

    let record = p.store.record(id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Dispatched);
    // At-least-once: the payload was observed twice...
    assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
    // ...but the idempotent handler ran its effect exactly once.
    assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn composed_bus_delivers_with_spawned_workers() {
    use futures::StreamExt;

    let store = MemoryOutboxStore::new();
    let transport = Arc::new(InProcessTransport::new());
    let settings = EventBusSettings {
        dispatch: fast_dispatch(),
        ..EventBusSettings::default()
    };
    let bus = EventBus::compose(Arc::new(store.clone()), transport, settings);

    let recorder = Arc::new(Recorder::default());
    bus.subscribe("telemetry.>", recorder.clone()).unwrap();
    let mut tap = bus.subscribe_stream("telemetry.>").unwrap();

    bus.start().await.unwrap();
    bus.publish("telemetry.ingested", &serde_json::json!({ "n": 42 }))
        .await
        .unwrap();

    // Workers poll every few milliseconds; wait for the delivery to land.
    let delivered = tokio::time::timeout(std::time::Duration::from_secs(5), tap.next())
        .await
        .expect("delivery timed out")
        .expect("tap closed");
    assert_eq!(delivered.topic, "telemetry.ingested");
    assert_eq!(delivered.payload["n"], 42);

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if store.count_in_status(OutboxStatus::Dispatched).await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("record never dispatched");

    assert_eq!(recorder.seen.lock().await.len(), 1);
    bus.shutdown().await;
}
