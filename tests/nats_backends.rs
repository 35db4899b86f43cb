//! Integration tests for the NATS-backed pieces: the time-series storage
//! engine and the document outbox store.
//!
//! These tests require a running NATS server with JetStream enabled.
//! Run with: `nats-server -js`. Without a server they skip cleanly.

use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use uuid::Uuid;

use telemetry_core::storage::{StorageAdapter, TimeSeriesConfig, TimeSeriesStorage};
use telemetry_core::{
    DeviceId, DeviceRecord, DocumentOutboxStore, NatsClient, NatsConfig, OutboxEvent,
    OutboxPublisher, OutboxStatus, OutboxStore, StorageSettings, TelemetryReading, TelemetryValue,
};

const NATS_URL: &str = "nats://localhost:4222";

/// Helper to check if NATS is available
async fn nats_available() -> bool {
    NatsClient::connect(NatsConfig::from_url(NATS_URL)).await.is_ok()
}

async fn test_client() -> NatsClient {
    NatsClient::connect(NatsConfig::from_url(NATS_URL))
        .await
        .expect("NATS connection")
}

fn ts_settings() -> StorageSettings {
    StorageSettings {
        connection: Some(NATS_URL.to_string()),
        ..Default::default()
    }
}

fn unique_ts_config(test_name: &str) -> TimeSeriesConfig {
    TimeSeriesConfig {
        stream_name: format!("TEST-TS-{}", test_name.to_uppercase()),
        subject: format!("test.ts.{test_name}"),
    }
}

#[tokio::test]
async fn timeseries_round_trip_and_replay() {
    if !nats_available().await {
        eprintln!("skipping: no NATS server on {NATS_URL}");
        return;
    }

    let config = unique_ts_config(&format!("roundtrip-{}", Uuid::new_v4().simple()));
    let storage = TimeSeriesStorage::new(test_client().await, config.clone(), &ts_settings())
        .await
        .unwrap();

    let device = DeviceId::new();
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
    let written = storage
        .write(vec![
            TelemetryReading::new(device, "temp", t2, TelemetryValue::Float(19.0)),
            TelemetryReading::new(device, "temp", t1, TelemetryValue::Float(21.5)),
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);

    let range: Vec<_> = storage
        .query_range(
            device,
            "temp",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(range.len(), 2);
    assert_eq!(range[0].ts, t1);
    assert_eq!(range[1].ts, t2);

    let latest = storage.query_latest(device, "temp").await.unwrap().unwrap();
    assert_eq!(latest.ts, t2);

    // A second engine instance over the same stream rebuilds its index by
    // replaying the log.
    let replayed = TimeSeriesStorage::new(test_client().await, config, &ts_settings())
        .await
        .unwrap();
    let latest = replayed.query_latest(device, "temp").await.unwrap().unwrap();
    assert_eq!(latest.ts, t2);
    assert_eq!(latest.value, TelemetryValue::Float(19.0));
}

#[tokio::test]
async fn document_store_commits_mutation_and_event_atomically() {
    if !nats_available().await {
        eprintln!("skipping: no NATS server on {NATS_URL}");
        return;
    }

    let config = telemetry_core::DocumentStoreConfig {
        bucket: format!("TEST-OUTBOX-{}", Uuid::new_v4().simple()),
    };
    let store = DocumentOutboxStore::with_client(test_client().await, config)
        .await
        .unwrap();
    let publisher = OutboxPublisher::new(std::sync::Arc::new(store.clone()));

    let device = DeviceRecord::new("gateway-1");
    let event = OutboxEvent::new("device.created", &serde_json::json!({"n": 1})).unwrap();
    publisher
        .publish(event, {
            let device = device.clone();
            move |tx| {
                Box::pin(async move {
                    tx.upsert_device(&device).await?;
                    Ok(())
                })
            }
        })
        .await
        .unwrap();

    assert!(store.get_device(device.id).await.unwrap().is_some());

    let claimed = store.claim_due("it-worker", Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let claim = &claimed[0];
    assert_eq!(claim.record.topic, "device.created");

    // A stale token loses; the real token transitions the record.
    assert!(!store
        .mark_dispatched(claim.record.id, Uuid::new_v4())
        .await
        .unwrap());
    assert!(store
        .mark_dispatched(claim.record.id, claim.token)
        .await
        .unwrap());
    let record = store.record(claim.record.id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Dispatched);
}
