//! # telemetry-core
//!
//! Pluggable persistence and reliable event delivery for IoT telemetry
//! platforms. Two contracts carry the whole crate:
//!
//! - **[`StorageAdapter`]**: one uniform telemetry read/write surface over
//!   interchangeable engines — a single shared table, date-sharded tables,
//!   or an append-log time-series engine — selected once at startup by
//!   [`storage::select`].
//! - **[`EventBus`]**: an outbox store (relational, document, or in-memory)
//!   composed with a transport (NATS JetStream or in-process) by
//!   [`bus::select`], with the [`OutboxPublisher`] guaranteeing that a
//!   domain mutation and its event are committed together and the
//!   [`Dispatcher`](bus::Dispatcher) guaranteeing at-least-once,
//!   per-topic-ordered delivery with retry and dead-lettering.
//!
//! [`Platform::start`] wires everything in a fixed order — config → storage
//! → outbox → event bus → handlers — with no process-wide globals;
//! reconfiguration means restart.
//!
//! ## Design principles
//!
//! 1. **One adapter per process**: backends are selected at startup and
//!    never swapped at runtime.
//! 2. **Callers only see contracts**: no downcasting, no backend leakage.
//! 3. **Failures are typed**: configuration problems abort startup, storage
//!    failures surface after bounded retries, delivery failures retry and
//!    dead-letter but are never silently dropped.
//! 4. **Idempotent consumers**: delivery is at-least-once; the platform
//!    deduplicates only by record id.

#![warn(missing_docs)]

pub mod bus;
mod devices;
mod errors;
mod ingest;
mod nats;
mod outbox;
mod platform;
mod reading;
mod retry;
mod settings;
mod sharding;
pub mod storage;
pub mod topics;

pub use bus::{
    EventBus, EventDelivery, EventHandler, HandlerError, IdempotentHandler, SubscriptionRegistry,
    TopicPattern,
};
pub use devices::{DeviceCreated, DeviceDirectory, DeviceRecord, DeviceRemoved, DeviceRenamed};
pub use errors::{PlatformError, PlatformResult};
pub use ingest::{TelemetryIngest, TelemetryIngested};
pub use nats::{NatsClient, NatsConfig, NatsError};
pub use outbox::{
    ClaimedEvent, DocumentOutboxStore, DocumentStoreConfig, FailureOutcome, MemoryOutboxStore,
    OutboxError, OutboxEvent, OutboxPublisher, OutboxRecord, OutboxStatus, OutboxStore,
    OutboxTransaction, RelationalOutboxStore,
};
pub use platform::Platform;
pub use reading::{DeviceId, TelemetryReading, TelemetryValue};
pub use retry::{retry, RetryPolicy, Transient};
pub use settings::{
    ConfigurationError, DispatchSettings, EventBusSettings, EventBusStoreKind,
    EventBusTransportKind, PlatformSettings, StorageKind, StorageSettings,
};
pub use sharding::{ShardGranularity, ShardId, ShardingPolicy};
pub use storage::{ReadingStream, StorageAdapter, StorageError};
