//! Platform assembly: explicit dependency injection in a fixed init order.
//!
//! `Platform::start` builds the process's single storage adapter and event
//! bus from validated settings — config → storage → outbox → event bus —
//! and hands out the services built on them. Handlers are registered next,
//! then [`Platform::start_dispatch`] brings the workers up. There is no
//! re-selection during the process lifetime: reconfiguring means
//! restarting.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::bus::{self, EventBus, EventHandler};
use crate::devices::DeviceDirectory;
use crate::errors::{PlatformError, PlatformResult};
use crate::ingest::TelemetryIngest;
use crate::outbox::{OutboxRecord, OutboxPublisher};
use crate::settings::{ConfigurationError, PlatformSettings};
use crate::storage::{self, StorageAdapter};

/// The assembled platform
#[derive(Debug)]
pub struct Platform {
    settings: PlatformSettings,
    storage: Arc<dyn StorageAdapter>,
    bus: Arc<EventBus>,
    ingest: TelemetryIngest,
    devices: DeviceDirectory,
}

impl Platform {
    /// Validate settings and assemble the platform.
    ///
    /// Fatal here: invalid settings ([`ConfigurationError`]) or an
    /// unreachable backend ([`PlatformError::BackendUnavailable`]). The
    /// process must not serve traffic if this fails.
    #[instrument(skip(settings))]
    pub async fn start(settings: PlatformSettings) -> PlatformResult<Self> {
        settings.validate()?;

        let storage = storage::select(&settings.storage).await?;
        let bus = Arc::new(bus::select(&settings.event_bus).await?);
        let publisher = bus.publisher();
        let ingest = TelemetryIngest::new(storage.clone(), publisher.clone());
        let devices = DeviceDirectory::new(publisher);

        info!("platform assembled");
        Ok(Self {
            settings,
            storage,
            bus,
            ingest,
            devices,
        })
    }

    /// Start transport delivery and the dispatch workers. Call after all
    /// startup subscriptions are registered.
    pub async fn start_dispatch(&self) -> PlatformResult<()> {
        self.bus.start().await.map_err(PlatformError::Transport)
    }

    /// The settings the platform was assembled from
    pub fn settings(&self) -> &PlatformSettings {
        &self.settings
    }

    /// The process-wide storage adapter
    pub fn storage(&self) -> Arc<dyn StorageAdapter> {
        self.storage.clone()
    }

    /// The composed event bus
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// The outbox publisher
    pub fn publisher(&self) -> Arc<OutboxPublisher> {
        self.bus.publisher()
    }

    /// Telemetry ingestion service
    pub fn telemetry(&self) -> &TelemetryIngest {
        &self.ingest
    }

    /// Device registry service
    pub fn devices(&self) -> &DeviceDirectory {
        &self.devices
    }

    /// Register a handler for every topic matching `pattern`
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConfigurationError> {
        self.bus.subscribe(pattern, handler)
    }

    /// Dead-lettered events, oldest first — the operator listing
    pub async fn dead_letters(&self, limit: usize) -> PlatformResult<Vec<OutboxRecord>> {
        self.bus
            .dead_letters(limit)
            .await
            .map_err(PlatformError::Outbox)
    }

    /// Stop dispatching. In-flight attempts are abandoned; records left
    /// Pending or claimed are reprocessed on the next start (at-least-once).
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        info!("platform stopped");
    }
}
