//! Telemetry storage: one uniform contract over interchangeable backends.
//!
//! A [`StorageAdapter`] hides a concrete engine — a single shared relational
//! table, a set of date-sharded tables, or an append-log time-series engine —
//! behind the same read/write surface. Exactly one adapter is constructed per
//! process, by [`select`], and injected into everything that needs storage.

mod merge;
mod postgres;
mod sharded;
mod single_table;
mod timeseries;

pub use sharded::{ShardEngine, ShardedStorage};
pub use single_table::SingleTableStorage;
pub use timeseries::{TimeSeriesConfig, TimeSeriesStorage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::errors::PlatformError;
use crate::reading::{DeviceId, TelemetryReading};
use crate::retry::Transient;
use crate::settings::{StorageKind, StorageSettings};

/// Errors surfaced by storage adapters
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable or connection lost
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// An I/O call exceeded its deadline
    #[error("Storage timeout: {what} took longer than {after_ms}ms")]
    Timeout {
        /// The operation that timed out
        what: &'static str,
        /// The deadline that was exceeded
        after_ms: u64,
    },

    /// The backend rejected the operation
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Stored data could not be encoded or decoded
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => StorageError::Unavailable(e.to_string()),
            sqlx::Error::PoolTimedOut => {
                StorageError::Unavailable("connection pool timed out".to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StorageError::Serialization(err.to_string())
            }
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Lazy, finite, timestamp-ascending sequence of readings
pub type ReadingStream =
    Pin<Box<dyn Stream<Item = Result<TelemetryReading, StorageError>> + Send>>;

/// Uniform telemetry read/write contract over a specific storage engine.
///
/// Implementations are internally thread-safe: concurrent writers from many
/// ingestion sources must not corrupt each other's routing or batches.
#[async_trait]
pub trait StorageAdapter: Send + Sync + fmt::Debug {
    /// Persist a batch of readings, returning the count written.
    ///
    /// Atomic per batch for the single-table and time-series engines. The
    /// sharded engine partitions the batch by shard key and commits one
    /// transaction per shard: a batch spanning two shards is not atomically
    /// visible across both, and callers must not depend on it.
    async fn write(&self, batch: Vec<TelemetryReading>) -> Result<u64, StorageError>;

    /// Readings for `(device, key)` in the half-open window `[from, to)`,
    /// ordered by timestamp ascending.
    async fn query_range(
        &self,
        device: DeviceId,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReadingStream, StorageError>;

    /// Most recent reading for `(device, key)`, if any
    async fn query_latest(
        &self,
        device: DeviceId,
        key: &str,
    ) -> Result<Option<TelemetryReading>, StorageError>;

    /// One connectivity round-trip; used by the selector at startup
    async fn ping(&self) -> Result<(), StorageError>;

    /// Which backend kind this adapter fronts
    fn kind(&self) -> StorageKind;
}

/// Build the storage adapter selected by `settings`.
///
/// This is the StorageSelector: it validates settings (fails with
/// [`ConfigurationError`](crate::settings::ConfigurationError) before any
/// I/O), constructs the matching adapter, and eagerly verifies connectivity
/// with one round-trip. An unreachable backend is startup-fatal — the process
/// must not serve traffic against an unverified backend.
pub async fn select(settings: &StorageSettings) -> Result<Arc<dyn StorageAdapter>, PlatformError> {
    settings.validate()?;

    let adapter: Arc<dyn StorageAdapter> = match settings.kind {
        StorageKind::SingleTable => Arc::new(
            SingleTableStorage::connect(settings)
                .await
                .map_err(|e| unavailable("postgres", e))?,
        ),
        StorageKind::Sharded => Arc::new(
            ShardedStorage::connect(settings)
                .await
                .map_err(|e| unavailable("postgres", e))?,
        ),
        StorageKind::TimeSeries => Arc::new(
            TimeSeriesStorage::connect(settings)
                .await
                .map_err(|e| unavailable("nats", e))?,
        ),
    };

    let backend = match settings.kind {
        StorageKind::SingleTable | StorageKind::Sharded => "postgres",
        StorageKind::TimeSeries => "nats",
    };
    adapter
        .ping()
        .await
        .map_err(|e| unavailable(backend, e))?;

    info!(kind = ?settings.kind, "telemetry storage selected");
    Ok(adapter)
}

fn unavailable(backend: &'static str, err: StorageError) -> PlatformError {
    PlatformError::BackendUnavailable {
        backend,
        reason: err.to_string(),
    }
}

/// Wrap a storage I/O future with the configured deadline.
pub(crate) async fn io_deadline<T, F>(
    limit: Duration,
    what: &'static str,
    fut: F,
) -> Result<T, StorageError>
where
    F: std::future::Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            what,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(StorageError::Timeout {
            what: "write",
            after_ms: 10
        }
        .is_transient());
        assert!(!StorageError::Backend("constraint".into()).is_transient());
        assert!(!StorageError::Serialization("bad".into()).is_transient());
    }

    #[tokio::test]
    async fn select_rejects_incomplete_settings_before_io() {
        // No connection string: must fail with a configuration error, not an
        // attempted connection.
        let settings = StorageSettings {
            kind: StorageKind::Sharded,
            ..Default::default()
        };
        let err = select(&settings).await.unwrap_err();
        assert!(matches!(err, PlatformError::Configuration(_)));
    }

    #[tokio::test]
    async fn io_deadline_times_out() {
        let result: Result<(), _> = io_deadline(Duration::from_millis(5), "probe", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StorageError::Timeout { .. })));
    }
}
