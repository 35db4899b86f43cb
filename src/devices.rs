//! Device registry: the domain rows co-located with the outbox.
//!
//! Device lifecycle mutations and their events are written together through
//! the [`OutboxPublisher`], so a registry row and the event announcing it
//! either both exist or neither does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::outbox::{OutboxError, OutboxEvent, OutboxPublisher};
use crate::reading::DeviceId;
use crate::topics;

/// One registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Whether the device may ingest telemetry
    pub enabled: bool,
    /// When the device was registered
    pub created_at: DateTime<Utc>,
    /// Last registry change
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// A fresh, enabled device
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DeviceId::new(),
            name: name.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Payload of the `device.created` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCreated {
    /// The new device
    pub device_id: DeviceId,
    /// Its display name
    pub name: String,
}

/// Payload of the `device.renamed` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRenamed {
    /// The renamed device
    pub device_id: DeviceId,
    /// Name after the change
    pub name: String,
}

/// Payload of the `device.removed` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRemoved {
    /// The removed device
    pub device_id: DeviceId,
}

/// Device lifecycle operations, each a mutation+event pair.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    publisher: Arc<OutboxPublisher>,
}

impl DeviceDirectory {
    /// Directory over the platform's outbox publisher
    pub fn new(publisher: Arc<OutboxPublisher>) -> Self {
        Self { publisher }
    }

    /// Register a device; the registry row and the `device.created` event
    /// are committed together.
    #[instrument(skip(self))]
    pub async fn create_device(&self, name: &str) -> Result<DeviceRecord, OutboxError> {
        let device = DeviceRecord::new(name);
        let event = OutboxEvent::new(
            topics::DEVICE_CREATED,
            &DeviceCreated {
                device_id: device.id,
                name: device.name.clone(),
            },
        )?;
        let row = device.clone();
        self.publisher
            .publish(event, move |tx| {
                Box::pin(async move {
                    tx.upsert_device(&row).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(device)
    }

    /// Rename a device; no-op error if the device is unknown.
    #[instrument(skip(self))]
    pub async fn rename_device(
        &self,
        id: DeviceId,
        name: &str,
    ) -> Result<DeviceRecord, OutboxError> {
        let existing = self
            .publisher
            .store()
            .get_device(id)
            .await?
            .ok_or_else(|| OutboxError::Store(format!("unknown device {id}")))?;
        let mut device = existing;
        device.name = name.to_string();
        device.updated_at = Utc::now();

        let event = OutboxEvent::new(
            topics::DEVICE_RENAMED,
            &DeviceRenamed {
                device_id: device.id,
                name: device.name.clone(),
            },
        )?;
        let row = device.clone();
        self.publisher
            .publish(event, move |tx| {
                Box::pin(async move {
                    tx.upsert_device(&row).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(device)
    }

    /// Remove a device; the row deletion and the `device.removed` event are
    /// committed together.
    #[instrument(skip(self))]
    pub async fn remove_device(&self, id: DeviceId) -> Result<(), OutboxError> {
        let event = OutboxEvent::new(topics::DEVICE_REMOVED, &DeviceRemoved { device_id: id })?;
        self.publisher
            .publish(event, move |tx| {
                Box::pin(async move { tx.delete_device(id).await })
            })
            .await
    }

    /// Look a device up in the registry
    pub async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, OutboxError> {
        self.publisher.store().get_device(id).await
    }
}
