//! Time-series engine adapter.
//!
//! Every batch is appended to a JetStream log as one message, which is the
//! atomicity unit, and applied to an in-memory ordered series index that
//! serves range and latest queries. On startup the index is rebuilt by
//! replaying the log from the beginning.

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::{self, stream::StorageType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use super::{io_deadline, ReadingStream, StorageAdapter, StorageError};
use crate::nats::{NatsClient, NatsConfig};
use crate::reading::{DeviceId, TelemetryReading, TelemetryValue};
use crate::retry::{retry, RetryPolicy};
use crate::settings::{StorageKind, StorageSettings};

/// Messages pulled per replay page
const REPLAY_PAGE: usize = 500;

/// Configuration for the time-series engine
#[derive(Debug, Clone)]
pub struct TimeSeriesConfig {
    /// Name of the JetStream stream backing the append log
    pub stream_name: String,
    /// Subject the batches are appended under
    pub subject: String,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            stream_name: "telemetry-series".to_string(),
            subject: "ts.batch".to_string(),
        }
    }
}

/// Ordered in-memory series state, one map per `(device, key)`.
#[derive(Debug, Default)]
struct SeriesIndex {
    series: HashMap<(DeviceId, String), BTreeMap<DateTime<Utc>, TelemetryValue>>,
}

impl SeriesIndex {
    /// Apply readings, returning how many were new (duplicates by
    /// `(device, key, ts)` are skipped: readings are append-only).
    fn apply(&mut self, readings: Vec<TelemetryReading>) -> u64 {
        let mut inserted = 0;
        for r in readings {
            let slot = self.series.entry((r.device, r.key)).or_default();
            if let std::collections::btree_map::Entry::Vacant(e) = slot.entry(r.ts) {
                e.insert(r.value);
                inserted += 1;
            }
        }
        inserted
    }

    fn range(
        &self,
        device: DeviceId,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<TelemetryReading> {
        if from >= to {
            return Vec::new();
        }
        self.series
            .get(&(device, key.to_string()))
            .map(|slot| {
                slot.range(from..to)
                    .map(|(ts, value)| TelemetryReading::new(device, key, *ts, value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn latest(&self, device: DeviceId, key: &str) -> Option<TelemetryReading> {
        self.series
            .get(&(device, key.to_string()))
            .and_then(|slot| slot.last_key_value())
            .map(|(ts, value)| TelemetryReading::new(device, key, *ts, value.clone()))
    }
}

/// JetStream-backed time-series storage adapter
#[derive(Debug)]
pub struct TimeSeriesStorage {
    client: NatsClient,
    config: TimeSeriesConfig,
    index: RwLock<SeriesIndex>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl TimeSeriesStorage {
    /// Connect using the storage settings' connection string.
    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let url = settings.connection.as_deref().unwrap_or_default();
        let client = NatsClient::connect(NatsConfig::from_url(url))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Self::new(client, TimeSeriesConfig::default(), settings).await
    }

    /// Build the engine over an existing connection: create the stream if
    /// needed and replay the log into the series index.
    pub async fn new(
        client: NatsClient,
        config: TimeSeriesConfig,
        settings: &StorageSettings,
    ) -> Result<Self, StorageError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![config.subject.clone()],
            storage: StorageType::File,
            ..Default::default()
        };
        client
            .jetstream()
            .create_stream(stream_config)
            .await
            .map_err(|e| StorageError::Unavailable(format!("failed to create stream: {e}")))?;

        let storage = Self {
            client,
            config,
            index: RwLock::new(SeriesIndex::default()),
            retry: RetryPolicy::new(
                settings.retry_max_attempts,
                Duration::from_millis(settings.retry_base_delay_ms),
            ),
            timeout: settings.operation_timeout(),
        };
        storage.replay().await?;
        Ok(storage)
    }

    /// Rebuild the series index from the append log.
    async fn replay(&self) -> Result<(), StorageError> {
        let stream = self
            .client
            .jetstream()
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let consumer = stream
            .create_consumer(pull::Config {
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let mut batches = 0u64;
        let mut readings = 0u64;
        loop {
            let mut page = consumer
                .fetch()
                .max_messages(REPLAY_PAGE)
                .messages()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;

            let mut fetched = 0;
            let mut decoded: Vec<Vec<TelemetryReading>> = Vec::new();
            while let Some(message) = page.next().await {
                let message = message.map_err(|e| StorageError::Unavailable(e.to_string()))?;
                let batch: Vec<TelemetryReading> = serde_json::from_slice(&message.payload)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                decoded.push(batch);
                fetched += 1;
            }

            // Apply after the page is fully read; the index lock is never
            // held across consumer I/O.
            let mut index = self.index.write().await;
            for batch in decoded {
                readings += index.apply(batch);
            }
            drop(index);

            batches += fetched as u64;
            if fetched < REPLAY_PAGE {
                break;
            }
        }
        info!(batches, readings, "time-series log replayed");
        Ok(())
    }

    async fn append(&self, payload: &Bytes) -> Result<(), StorageError> {
        self.client
            .jetstream()
            .publish(self.config.subject.clone(), payload.clone())
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for TimeSeriesStorage {
    #[instrument(skip(self, batch), fields(batch_len = batch.len()))]
    async fn write(&self, batch: Vec<TelemetryReading>) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let payload = Bytes::from(
            serde_json::to_vec(&batch)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        );
        // One appended message per batch: the log entry either lands with
        // every reading or not at all.
        retry(&self.retry, "time-series append", || {
            io_deadline(self.timeout, "write", self.append(&payload))
        })
        .await?;

        Ok(self.index.write().await.apply(batch))
    }

    async fn query_range(
        &self,
        device: DeviceId,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReadingStream, StorageError> {
        let rows = self.index.read().await.range(device, key, from, to);
        Ok(Box::pin(futures::stream::iter(
            rows.into_iter().map(Ok::<_, StorageError>),
        )))
    }

    async fn query_latest(
        &self,
        device: DeviceId,
        key: &str,
    ) -> Result<Option<TelemetryReading>, StorageError> {
        Ok(self.index.read().await.latest(device, key))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        io_deadline(self.timeout, "ping", async {
            self.client
                .ping()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))
        })
        .await
    }

    fn kind(&self) -> StorageKind {
        StorageKind::TimeSeries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn reading(device: DeviceId, at: DateTime<Utc>, v: i64) -> TelemetryReading {
        TelemetryReading::new(device, "rpm", at, TelemetryValue::Integer(v))
    }

    #[test]
    fn index_orders_and_bounds_ranges() {
        let device = DeviceId::new();
        let mut index = SeriesIndex::default();
        index.apply(vec![
            reading(device, ts(2, 0), 2),
            reading(device, ts(1, 0), 1),
            reading(device, ts(3, 0), 3),
        ]);

        let rows = index.range(device, "rpm", ts(1, 0), ts(3, 0));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, ts(1, 0));
        assert_eq!(rows[1].ts, ts(2, 0));
    }

    #[test]
    fn index_latest_returns_newest() {
        let device = DeviceId::new();
        let mut index = SeriesIndex::default();
        index.apply(vec![reading(device, ts(1, 0), 1), reading(device, ts(5, 0), 5)]);
        assert_eq!(index.latest(device, "rpm").unwrap().ts, ts(5, 0));
        assert!(index.latest(DeviceId::new(), "rpm").is_none());
    }

    #[test]
    fn index_skips_duplicate_timestamps() {
        let device = DeviceId::new();
        let mut index = SeriesIndex::default();
        assert_eq!(index.apply(vec![reading(device, ts(1, 0), 1)]), 1);
        assert_eq!(index.apply(vec![reading(device, ts(1, 0), 9)]), 0);
        // First write wins: readings are immutable once written.
        let kept = index.latest(device, "rpm").unwrap();
        assert_eq!(kept.value, TelemetryValue::Integer(1));
    }

    #[test]
    fn empty_window_is_empty() {
        let device = DeviceId::new();
        let mut index = SeriesIndex::default();
        index.apply(vec![reading(device, ts(1, 0), 1)]);
        assert!(index.range(device, "rpm", ts(2, 0), ts(2, 0)).is_empty());
    }
}
