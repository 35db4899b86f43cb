//! Telemetry ingestion: the narrow call upstream collaborators use.
//!
//! Readings arrive already parsed (wire protocols are out of scope). A batch
//! is written through the active storage adapter first; only when the write
//! succeeds is a `telemetry.ingested` event published per device in the
//! batch. The readings live in the telemetry store, which may differ from
//! the outbox store, so the event carries no transactional mutation —
//! upstream redelivery of a failed ingestion is the reconciliation path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::errors::{PlatformError, PlatformResult};
use crate::outbox::{OutboxEvent, OutboxPublisher};
use crate::reading::{DeviceId, TelemetryReading};
use crate::storage::StorageAdapter;
use crate::topics;

/// Payload of the `telemetry.ingested` event, one per device per batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngested {
    /// Device the readings belong to
    pub device_id: DeviceId,
    /// Distinct keys that received readings
    pub keys: Vec<String>,
    /// Number of readings persisted for the device
    pub count: u64,
    /// Earliest timestamp in the device's slice
    pub from: DateTime<Utc>,
    /// Latest timestamp in the device's slice
    pub to: DateTime<Utc>,
}

/// Ingestion service wired over the active storage adapter and the outbox.
#[derive(Debug, Clone)]
pub struct TelemetryIngest {
    storage: Arc<dyn StorageAdapter>,
    publisher: Arc<OutboxPublisher>,
}

impl TelemetryIngest {
    /// Service over the selected adapter and publisher
    pub fn new(storage: Arc<dyn StorageAdapter>, publisher: Arc<OutboxPublisher>) -> Self {
        Self { storage, publisher }
    }

    /// Persist a batch and announce it downstream.
    ///
    /// Returns the number of readings written. A storage failure (after the
    /// adapter's internal retries) or a failed event enqueue surfaces to the
    /// caller; nothing is silently dropped.
    #[instrument(skip(self, batch), fields(batch_len = batch.len()))]
    pub async fn ingest(&self, batch: Vec<TelemetryReading>) -> PlatformResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let summaries = summarize(&batch);
        let written = self.storage.write(batch).await?;

        for summary in summaries {
            let event = OutboxEvent::new(topics::TELEMETRY_INGESTED, &summary)
                .map_err(PlatformError::Outbox)?;
            self.publisher
                .publish_event(event)
                .await
                .map_err(PlatformError::Outbox)?;
        }
        Ok(written)
    }
}

/// Group a batch into one event summary per device.
fn summarize(batch: &[TelemetryReading]) -> Vec<TelemetryIngested> {
    let mut per_device: BTreeMap<DeviceId, TelemetryIngested> = BTreeMap::new();
    for reading in batch {
        let entry = per_device
            .entry(reading.device)
            .or_insert_with(|| TelemetryIngested {
                device_id: reading.device,
                keys: Vec::new(),
                count: 0,
                from: reading.ts,
                to: reading.ts,
            });
        entry.count += 1;
        entry.from = entry.from.min(reading.ts);
        entry.to = entry.to.max(reading.ts);
        if !entry.keys.contains(&reading.key) {
            entry.keys.push(reading.key.clone());
        }
    }
    per_device.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::TelemetryValue;
    use chrono::{TimeZone, Timelike};

    fn reading(device: DeviceId, key: &str, hour: u32) -> TelemetryReading {
        TelemetryReading::new(
            device,
            key,
            Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            TelemetryValue::Integer(hour as i64),
        )
    }

    #[test]
    fn batches_summarize_per_device() {
        let d1 = DeviceId::new();
        let d2 = DeviceId::new();
        let batch = vec![
            reading(d1, "temp", 3),
            reading(d1, "temp", 1),
            reading(d1, "humidity", 2),
            reading(d2, "temp", 5),
        ];

        let mut summaries = summarize(&batch);
        summaries.sort_by_key(|s| std::cmp::Reverse(s.count));

        assert_eq!(summaries.len(), 2);
        let first = &summaries[0];
        assert_eq!(first.device_id, d1);
        assert_eq!(first.count, 3);
        assert_eq!(first.keys, vec!["temp".to_string(), "humidity".to_string()]);
        assert_eq!(first.from.time().hour(), 1);
        assert_eq!(first.to.time().hour(), 3);
        assert_eq!(summaries[1].count, 1);
    }
}
