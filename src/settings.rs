//! Startup configuration surface.
//!
//! Settings are read once at process start and are immutable afterwards:
//! changing a backend means restarting the process. `validate` runs before
//! any connection is opened, so incomplete settings fail fast with a
//! [`ConfigurationError`] instead of a half-assembled platform.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::sharding::ShardingPolicy;

/// Errors produced by settings validation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A required setting is absent for the selected backend
    #[error("Missing setting `{setting}`: {reason}")]
    Missing {
        /// Dotted path of the missing setting
        setting: &'static str,
        /// Why the setting is required
        reason: &'static str,
    },

    /// A setting is present but outside its valid range
    #[error("Invalid setting `{setting}`: {reason}")]
    Invalid {
        /// Dotted path of the offending setting
        setting: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Which telemetry storage backend to assemble.
///
/// Exactly one adapter is constructed per process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// One shared relational table
    SingleTable,
    /// Date-sharded relational tables
    Sharded,
    /// Append-log backed time-series engine
    TimeSeries,
}

/// Telemetry storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Selected backend kind
    pub kind: StorageKind,
    /// Connection string: a PostgreSQL URL for the relational kinds, a NATS
    /// URL for the time-series engine
    pub connection: Option<String>,
    /// Sharding policy; required when `kind` is `Sharded`
    pub sharding: Option<ShardingPolicy>,
    /// Per-call I/O timeout in milliseconds
    pub operation_timeout_ms: u64,
    /// Transient-failure retry cap (attempts, including the first)
    pub retry_max_attempts: u32,
    /// Base delay for retry backoff in milliseconds
    pub retry_base_delay_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::SingleTable,
            connection: None,
            sharding: None,
            operation_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl StorageSettings {
    /// Per-call I/O timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validate completeness for the selected kind
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(ConfigurationError::Missing {
                setting: "storage.connection",
                reason: "every storage kind needs a backend connection string",
            });
        }
        if self.kind == StorageKind::Sharded && self.sharding.is_none() {
            return Err(ConfigurationError::Missing {
                setting: "storage.sharding",
                reason: "sharded storage needs an expansion granularity",
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                setting: "storage.retry_max_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

/// Which backend persists outbox records and the co-located domain rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBusStoreKind {
    /// PostgreSQL tables
    Relational,
    /// NATS KV buckets
    Document,
    /// Process-local store
    InMemory,
}

/// Which transport carries dispatched events to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBusTransportKind {
    /// NATS JetStream broker
    Nats,
    /// Direct in-process dispatch
    InProcess,
}

/// Dispatch worker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Number of concurrent dispatch workers
    pub workers: usize,
    /// Cooperative wait between empty polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum records claimed per poll
    pub batch_size: usize,
    /// Timeout for one transport publish attempt, in milliseconds
    pub attempt_timeout_ms: u64,
    /// Attempt cap before a record is dead-lettered
    pub max_attempts: u32,
    /// Base delay for retry backoff, in milliseconds
    pub backoff_base_ms: u64,
    /// Ceiling for retry backoff, in milliseconds
    pub backoff_max_ms: u64,
    /// Claim lease; claims older than this are considered abandoned and
    /// reprocessed (at-least-once)
    pub claim_lease_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 200,
            batch_size: 32,
            attempt_timeout_ms: 10_000,
            max_attempts: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            claim_lease_secs: 60,
        }
    }
}

impl DispatchSettings {
    /// Cooperative wait between empty polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout for one transport publish attempt
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Claim lease duration
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

/// Event bus settings: store × transport plus dispatch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusSettings {
    /// Outbox store backend
    pub store: EventBusStoreKind,
    /// Store connection string; required unless the store is in-memory
    pub store_endpoint: Option<String>,
    /// Transport backend
    pub transport: EventBusTransportKind,
    /// Transport connection string; required unless the transport is
    /// in-process
    pub transport_endpoint: Option<String>,
    /// Dispatch worker tuning
    pub dispatch: DispatchSettings,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            store: EventBusStoreKind::InMemory,
            store_endpoint: None,
            transport: EventBusTransportKind::InProcess,
            transport_endpoint: None,
            dispatch: DispatchSettings::default(),
        }
    }
}

impl EventBusSettings {
    /// Validate completeness of the store × transport pairing.
    ///
    /// Only missing endpoints are rejected. Pairings the platform cannot
    /// vouch for (a process-local store behind a distributed broker) are
    /// logged, not refused: the matrix is deliberately open.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.store != EventBusStoreKind::InMemory
            && self
                .store_endpoint
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(ConfigurationError::Missing {
                setting: "event_bus.store_endpoint",
                reason: "non-in-memory event stores need a connection string",
            });
        }
        if self.transport != EventBusTransportKind::InProcess
            && self
                .transport_endpoint
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(ConfigurationError::Missing {
                setting: "event_bus.transport_endpoint",
                reason: "broker transports need a connection string",
            });
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigurationError::Invalid {
                setting: "event_bus.dispatch.workers",
                reason: "at least one dispatch worker is required".to_string(),
            });
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                setting: "event_bus.dispatch.max_attempts",
                reason: "at least one dispatch attempt is required".to_string(),
            });
        }
        if self.dispatch.batch_size == 0 {
            return Err(ConfigurationError::Invalid {
                setting: "event_bus.dispatch.batch_size",
                reason: "claim batches must be non-empty".to_string(),
            });
        }
        if self.store == EventBusStoreKind::InMemory
            && self.transport == EventBusTransportKind::Nats
        {
            warn!(
                "event bus pairs a process-local store with a distributed transport; \
                 outbox state will not be shared across processes"
            );
        }
        Ok(())
    }
}

/// Full platform configuration, read once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Telemetry storage selection
    pub storage: StorageSettings,
    /// Event bus selection
    pub event_bus: EventBusSettings,
}

impl PlatformSettings {
    /// Validate the whole configuration before any backend I/O
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.storage.validate()?;
        self.event_bus.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ShardGranularity;

    fn storage(kind: StorageKind) -> StorageSettings {
        StorageSettings {
            kind,
            connection: Some("postgres://localhost/telemetry".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn sharded_without_granularity_is_rejected() {
        let settings = storage(StorageKind::Sharded);
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Missing {
                setting: "storage.sharding",
                ..
            }
        ));
    }

    #[test]
    fn sharded_with_policy_passes() {
        let mut settings = storage(StorageKind::Sharded);
        settings.sharding = Some(ShardingPolicy::new(ShardGranularity::Day));
        settings.validate().unwrap();
    }

    #[test]
    fn missing_connection_is_rejected_for_every_kind() {
        for kind in [
            StorageKind::SingleTable,
            StorageKind::Sharded,
            StorageKind::TimeSeries,
        ] {
            let settings = StorageSettings {
                kind,
                ..Default::default()
            };
            assert!(settings.validate().is_err(), "{kind:?} accepted no connection");
        }
    }

    #[test]
    fn relational_store_needs_an_endpoint() {
        let settings = EventBusSettings {
            store: EventBusStoreKind::Relational,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Missing {
                setting: "event_bus.store_endpoint",
                ..
            }
        ));
    }

    #[test]
    fn broker_transport_needs_an_endpoint() {
        let settings = EventBusSettings {
            transport: EventBusTransportKind::Nats,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn in_memory_defaults_validate() {
        PlatformSettings {
            storage: storage(StorageKind::SingleTable),
            event_bus: EventBusSettings::default(),
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn zero_workers_is_invalid() {
        let mut settings = EventBusSettings::default();
        settings.dispatch.workers = 0;
        assert!(settings.validate().is_err());
    }
}
