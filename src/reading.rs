//! Telemetry data model: device identifiers, values, readings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque device identifier.
///
/// Readings are keyed by `(device, key, ts)`; the platform never interprets
/// the identifier beyond equality and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generate a fresh device identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing identifier
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying uuid
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single telemetry value.
///
/// The variants mirror the columns of the relational layout: a kind
/// discriminant plus one typed column per variant (see
/// [`TelemetryValue::kind_code`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TelemetryValue {
    /// Boolean reading (switch state, alarm flag)
    Bool(bool),
    /// Free-form text reading
    Text(String),
    /// 64-bit integer reading (counters)
    Integer(i64),
    /// Double-precision reading (sensor measurements)
    Float(f64),
    /// Opaque binary blob
    Binary(Vec<u8>),
}

impl TelemetryValue {
    /// Stable discriminant stored in the `value_kind` column
    pub fn kind_code(&self) -> i16 {
        match self {
            TelemetryValue::Bool(_) => 0,
            TelemetryValue::Text(_) => 1,
            TelemetryValue::Integer(_) => 2,
            TelemetryValue::Float(_) => 3,
            TelemetryValue::Binary(_) => 4,
        }
    }

    /// Human-readable name of the variant
    pub fn kind_name(&self) -> &'static str {
        match self {
            TelemetryValue::Bool(_) => "bool",
            TelemetryValue::Text(_) => "text",
            TelemetryValue::Integer(_) => "integer",
            TelemetryValue::Float(_) => "float",
            TelemetryValue::Binary(_) => "binary",
        }
    }
}

/// One immutable telemetry reading.
///
/// Owned by whichever storage adapter persisted it; never mutated, only
/// appended and later purged per retention policy (out of scope here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Device that produced the reading
    pub device: DeviceId,
    /// Telemetry key, e.g. `temperature`
    pub key: String,
    /// Timestamp assigned by the ingestion collaborator
    pub ts: DateTime<Utc>,
    /// The value
    pub value: TelemetryValue,
}

impl TelemetryReading {
    /// Convenience constructor
    pub fn new(
        device: DeviceId,
        key: impl Into<String>,
        ts: DateTime<Utc>,
        value: TelemetryValue,
    ) -> Self {
        Self {
            device,
            key: key.into(),
            ts,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(TelemetryValue::Bool(true).kind_code(), 0);
        assert_eq!(TelemetryValue::Text("a".into()).kind_code(), 1);
        assert_eq!(TelemetryValue::Integer(7).kind_code(), 2);
        assert_eq!(TelemetryValue::Float(1.5).kind_code(), 3);
        assert_eq!(TelemetryValue::Binary(vec![1]).kind_code(), 4);
    }

    #[test]
    fn reading_serde_round_trip() {
        let reading = TelemetryReading::new(
            DeviceId::new(),
            "temp",
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            TelemetryValue::Float(21.5),
        );
        let json = serde_json::to_string(&reading).unwrap();
        let back: TelemetryReading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn value_json_shape_is_tagged() {
        let json = serde_json::to_value(TelemetryValue::Integer(42)).unwrap();
        assert_eq!(json["kind"], "integer");
        assert_eq!(json["value"], 42);
    }
}
