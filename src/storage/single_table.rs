//! Single shared-table storage adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::time::Duration;
use tracing::instrument;

use super::{io_deadline, postgres, ReadingStream, StorageAdapter, StorageError};
use crate::reading::{DeviceId, TelemetryReading};
use crate::retry::{retry, RetryPolicy};
use crate::settings::{StorageKind, StorageSettings};

/// All readings in one relational table, batches committed in a single
/// transaction.
#[derive(Debug)]
pub struct SingleTableStorage {
    pool: PgPool,
    table: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SingleTableStorage {
    /// Default table name
    pub const TABLE: &'static str = "telemetry_data";

    /// Connect and ensure the table exists.
    pub async fn connect(settings: &StorageSettings) -> Result<Self, StorageError> {
        let url = settings
            .connection
            .as_deref()
            .unwrap_or_default();
        let timeout = settings.operation_timeout();
        let pool = postgres::connect_pool(url, timeout).await?;
        postgres::ensure_telemetry_table(&pool, Self::TABLE).await?;
        Ok(Self {
            pool,
            table: Self::TABLE.to_string(),
            retry: RetryPolicy::new(
                settings.retry_max_attempts,
                Duration::from_millis(settings.retry_base_delay_ms),
            ),
            timeout,
        })
    }

    /// Adapter over an existing pool; used when the caller manages the pool.
    pub fn with_pool(pool: PgPool, settings: &StorageSettings) -> Self {
        Self {
            pool,
            table: Self::TABLE.to_string(),
            retry: RetryPolicy::new(
                settings.retry_max_attempts,
                Duration::from_millis(settings.retry_base_delay_ms),
            ),
            timeout: settings.operation_timeout(),
        }
    }

    async fn write_batch(&self, batch: &[TelemetryReading]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for reading in batch {
            written += postgres::insert_reading(&mut tx, &self.table, reading).await?;
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl StorageAdapter for SingleTableStorage {
    #[instrument(skip(self, batch), fields(batch_len = batch.len()))]
    async fn write(&self, batch: Vec<TelemetryReading>) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        retry(&self.retry, "single-table write", || {
            io_deadline(self.timeout, "write", self.write_batch(&batch))
        })
        .await
    }

    async fn query_range(
        &self,
        device: DeviceId,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReadingStream, StorageError> {
        Ok(postgres::range_cursor(
            self.pool.clone(),
            self.table.clone(),
            device,
            key.to_string(),
            from,
            to,
        ))
    }

    async fn query_latest(
        &self,
        device: DeviceId,
        key: &str,
    ) -> Result<Option<TelemetryReading>, StorageError> {
        retry(&self.retry, "single-table latest", || {
            io_deadline(
                self.timeout,
                "query_latest",
                postgres::latest_reading(&self.pool, &self.table, device, key),
            )
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        io_deadline(self.timeout, "ping", async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(StorageError::from)?;
            Ok(())
        })
        .await
    }

    fn kind(&self) -> StorageKind {
        StorageKind::SingleTable
    }
}
