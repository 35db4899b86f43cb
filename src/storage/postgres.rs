//! Shared PostgreSQL plumbing for the relational storage adapters.
//!
//! The row layout follows the classic telemetry shape: a kind discriminant
//! plus one typed column per value variant, keyed by `(device_id, key, ts)`.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{ReadingStream, StorageError};
use crate::reading::{DeviceId, TelemetryReading, TelemetryValue};

/// Rows fetched per page by the keyset cursor
pub(crate) const PAGE_SIZE: i64 = 512;

pub(crate) async fn connect_pool(
    url: &str,
    acquire_timeout: Duration,
) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .map_err(|e| StorageError::Unavailable(format!("failed to connect to postgres: {e}")))
}

/// Create a telemetry table (and its range index) if it does not exist yet.
pub(crate) async fn ensure_telemetry_table(
    pool: &PgPool,
    table: &str,
) -> Result<(), StorageError> {
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            device_id  UUID NOT NULL,
            key        TEXT NOT NULL,
            ts         TIMESTAMPTZ NOT NULL,
            value_kind SMALLINT NOT NULL,
            v_bool     BOOLEAN,
            v_string   TEXT,
            v_long     BIGINT,
            v_double   DOUBLE PRECISION,
            v_bytes    BYTEA,
            PRIMARY KEY (device_id, key, ts)
        );
        "#
    );
    sqlx::query(&ddl).execute(pool).await?;

    let index = format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table} (ts);"
    );
    sqlx::query(&index).execute(pool).await?;
    Ok(())
}

/// Insert one reading inside an open transaction. Duplicate `(device, key,
/// ts)` rows are skipped: readings are immutable and append-only.
pub(crate) async fn insert_reading(
    conn: &mut PgConnection,
    table: &str,
    reading: &TelemetryReading,
) -> Result<u64, StorageError> {
    let sql = format!(
        "INSERT INTO {table} \
         (device_id, key, ts, value_kind, v_bool, v_string, v_long, v_double, v_bytes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (device_id, key, ts) DO NOTHING"
    );

    let (kind, v_bool, v_string, v_long, v_double, v_bytes) = value_columns(&reading.value);
    let result = sqlx::query(&sql)
        .bind(reading.device.as_uuid())
        .bind(&reading.key)
        .bind(reading.ts)
        .bind(kind)
        .bind(v_bool)
        .bind(v_string)
        .bind(v_long)
        .bind(v_double)
        .bind(v_bytes)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

type ValueColumns = (
    i16,
    Option<bool>,
    Option<String>,
    Option<i64>,
    Option<f64>,
    Option<Vec<u8>>,
);

fn value_columns(value: &TelemetryValue) -> ValueColumns {
    match value {
        TelemetryValue::Bool(b) => (value.kind_code(), Some(*b), None, None, None, None),
        TelemetryValue::Text(s) => (value.kind_code(), None, Some(s.clone()), None, None, None),
        TelemetryValue::Integer(i) => (value.kind_code(), None, None, Some(*i), None, None),
        TelemetryValue::Float(f) => (value.kind_code(), None, None, None, Some(*f), None),
        TelemetryValue::Binary(b) => (value.kind_code(), None, None, None, None, Some(b.clone())),
    }
}

pub(crate) fn decode_row(row: &PgRow) -> Result<TelemetryReading, StorageError> {
    let device: Uuid = row.try_get("device_id")?;
    let key: String = row.try_get("key")?;
    let ts: DateTime<Utc> = row.try_get("ts")?;
    let kind: i16 = row.try_get("value_kind")?;

    let value = match kind {
        0 => TelemetryValue::Bool(require(row.try_get::<Option<bool>, _>("v_bool")?, "v_bool")?),
        1 => TelemetryValue::Text(require(
            row.try_get::<Option<String>, _>("v_string")?,
            "v_string",
        )?),
        2 => TelemetryValue::Integer(require(
            row.try_get::<Option<i64>, _>("v_long")?,
            "v_long",
        )?),
        3 => TelemetryValue::Float(require(
            row.try_get::<Option<f64>, _>("v_double")?,
            "v_double",
        )?),
        4 => TelemetryValue::Binary(require(
            row.try_get::<Option<Vec<u8>>, _>("v_bytes")?,
            "v_bytes",
        )?),
        other => {
            return Err(StorageError::Serialization(format!(
                "unknown value_kind {other}"
            )))
        }
    };

    Ok(TelemetryReading {
        device: DeviceId::from_uuid(device),
        key,
        ts,
        value,
    })
}

fn require<T>(value: Option<T>, column: &str) -> Result<T, StorageError> {
    value.ok_or_else(|| {
        StorageError::Serialization(format!("value_kind points at NULL column {column}"))
    })
}

/// Keyset-paged cursor over `[from, to)` for one `(device, key)` series,
/// ascending by timestamp. Fetches `PAGE_SIZE` rows at a time, so result
/// sets of any size stream with bounded memory.
pub(crate) fn range_cursor(
    pool: PgPool,
    table: String,
    device: DeviceId,
    key: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> ReadingStream {
    Box::pin(try_stream! {
        let mut after = from;
        let mut inclusive = true;
        loop {
            let op = if inclusive { ">=" } else { ">" };
            let sql = format!(
                "SELECT device_id, key, ts, value_kind, v_bool, v_string, v_long, v_double, v_bytes \
                 FROM {table} \
                 WHERE device_id = $1 AND key = $2 AND ts {op} $3 AND ts < $4 \
                 ORDER BY ts ASC LIMIT $5"
            );
            let rows = sqlx::query(&sql)
                .bind(device.as_uuid())
                .bind(&key)
                .bind(after)
                .bind(to)
                .bind(PAGE_SIZE)
                .fetch_all(&pool)
                .await
                .map_err(StorageError::from)?;

            let full_page = rows.len() as i64 == PAGE_SIZE;
            for row in &rows {
                let reading = decode_row(row)?;
                after = reading.ts;
                yield reading;
            }
            if !full_page {
                break;
            }
            inclusive = false;
        }
    })
}

/// Most recent reading in `table` for one `(device, key)` series.
pub(crate) async fn latest_reading(
    pool: &PgPool,
    table: &str,
    device: DeviceId,
    key: &str,
) -> Result<Option<TelemetryReading>, StorageError> {
    let sql = format!(
        "SELECT device_id, key, ts, value_kind, v_bool, v_string, v_long, v_double, v_bytes \
         FROM {table} WHERE device_id = $1 AND key = $2 \
         ORDER BY ts DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(device.as_uuid())
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(decode_row).transpose()
}
