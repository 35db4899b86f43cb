//! Well-known event topics published by the platform.

/// A telemetry batch was persisted for a device
pub const TELEMETRY_INGESTED: &str = "telemetry.ingested";

/// A device was registered
pub const DEVICE_CREATED: &str = "device.created";

/// A device was renamed
pub const DEVICE_RENAMED: &str = "device.renamed";

/// A device was removed from the registry
pub const DEVICE_REMOVED: &str = "device.removed";
