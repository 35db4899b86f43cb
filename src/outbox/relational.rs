//! Relational outbox store over PostgreSQL.
//!
//! The `outbox` and `devices` tables live in the same database, so a unit of
//! work is a plain SQL transaction. Claims are an atomic conditional UPDATE
//! carrying a claim token; concurrent workers that pick the same candidate
//! are resolved by the `status = 'pending'` recheck, and the loser simply
//! gets no row back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::store::{FailureOutcome, OutboxStore, OutboxTransaction};
use super::{ClaimedEvent, OutboxError, OutboxEvent, OutboxRecord, OutboxStatus};
use crate::devices::DeviceRecord;
use crate::reading::DeviceId;

const RECORD_COLUMNS: &str =
    "id, seq, topic, payload, created_at, status, attempts, not_before, last_error";

/// PostgreSQL-backed outbox store
#[derive(Debug, Clone)]
pub struct RelationalOutboxStore {
    pool: PgPool,
}

impl RelationalOutboxStore {
    /// Connect to the endpoint and ensure the schema exists.
    pub async fn connect(endpoint: &str) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(endpoint)
            .await
            .map_err(|e| OutboxError::Unavailable(format!("failed to connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Store over an existing pool; still ensures the schema.
    pub async fn with_pool(pool: PgPool) -> Result<Self, OutboxError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id          UUID PRIMARY KEY,
                seq         BIGSERIAL,
                topic       TEXT NOT NULL,
                payload     JSONB NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                attempts    INT NOT NULL DEFAULT 0,
                not_before  TIMESTAMPTZ,
                claim_token UUID,
                claimed_at  TIMESTAMPTZ,
                last_error  TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_status_seq ON outbox (status, seq);",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id         UUID PRIMARY KEY,
                name       TEXT NOT NULL,
                enabled    BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// One connectivity round-trip
    pub async fn ping(&self) -> Result<(), OutboxError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Io(e) => OutboxError::Unavailable(e.to_string()),
        sqlx::Error::PoolTimedOut => OutboxError::Unavailable("pool timed out".to_string()),
        other => OutboxError::Store(other.to_string()),
    }
}

fn decode_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let status: String = row.try_get("status").map_err(store_err)?;
    let seq: i64 = row.try_get("seq").map_err(store_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(store_err)?;
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(store_err)?,
        seq: seq as u64,
        topic: row.try_get("topic").map_err(store_err)?,
        payload: row.try_get("payload").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        status: OutboxStatus::parse(&status)?,
        attempts: attempts as u32,
        not_before: row.try_get("not_before").map_err(store_err)?,
        last_error: row.try_get("last_error").map_err(store_err)?,
    })
}

async fn insert_record(
    tx: &mut Transaction<'static, Postgres>,
    record: &OutboxRecord,
) -> Result<(), OutboxError> {
    sqlx::query(
        "INSERT INTO outbox (id, topic, payload, created_at, status, attempts, not_before) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(record.id)
    .bind(&record.topic)
    .bind(&record.payload)
    .bind(record.created_at)
    .bind(record.status.as_str())
    .bind(record.attempts as i32)
    .bind(record.not_before)
    .execute(&mut **tx)
    .await
    .map_err(store_err)?;
    Ok(())
}

#[async_trait]
impl OutboxStore for RelationalOutboxStore {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        let tx = self.pool.begin().await.map_err(store_err)?;
        Ok(Box::new(PgOutboxTransaction { tx }))
    }

    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        insert_record(&mut tx, &record).await?;
        tx.commit().await.map_err(store_err)
    }

    async fn claim_due(
        &self,
        _worker: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        // Sweep due Failed records back to Pending.
        sqlx::query(
            "UPDATE outbox SET status = 'pending' \
             WHERE status = 'failed' AND (not_before IS NULL OR not_before <= $1)",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        // Only each topic's head — its oldest non-terminal record — is a
        // candidate, so a record awaiting retry or already claimed blocks
        // its topic's successors (per-topic ordering). The
        // `status = 'pending'` recheck in the UPDATE is the compare-and-set:
        // a concurrent claimer that got there first leaves nothing for us to
        // update, and a head that is claimed or not yet due claims nothing
        // for its topic.
        let token = Uuid::new_v4();
        let sql = format!(
            "UPDATE outbox SET status = 'claimed', claim_token = $1, claimed_at = $2 \
             WHERE status = 'pending' AND (not_before IS NULL OR not_before <= $2) AND id IN ( \
                 SELECT id FROM ( \
                     SELECT DISTINCT ON (topic) id, seq FROM outbox \
                     WHERE status IN ('pending', 'failed', 'claimed') \
                     ORDER BY topic, seq \
                 ) heads ORDER BY seq LIMIT $3 \
             ) RETURNING {RECORD_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(token)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                decode_record(row).map(|record| ClaimedEvent { record, token })
            })
            .collect()
    }

    async fn mark_dispatched(&self, id: Uuid, token: Uuid) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'dispatched', attempts = attempts + 1, \
                 claim_token = NULL, claimed_at = NULL \
             WHERE id = $1 AND claim_token = $2 AND status = 'claimed'",
        )
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        token: Uuid,
        outcome: FailureOutcome,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox SET \
                 status = CASE WHEN $3::timestamptz IS NULL THEN 'dead_lettered' ELSE 'failed' END, \
                 attempts = attempts + 1, \
                 not_before = $3, \
                 last_error = $4, \
                 claim_token = NULL, \
                 claimed_at = NULL \
             WHERE id = $1 AND claim_token = $2 AND status = 'claimed'",
        )
        .bind(id)
        .bind(token)
        .bind(outcome.retry_at)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'pending', claim_token = NULL, claimed_at = NULL \
             WHERE status = 'claimed' AND claimed_at < $1",
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM outbox \
             WHERE status = 'dead_lettered' ORDER BY seq LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(decode_record).collect()
    }

    async fn record(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, OutboxError> {
        let row = sqlx::query(
            "SELECT id, name, enabled, created_at, updated_at FROM devices WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(|row| {
            Ok(DeviceRecord {
                id: DeviceId::from_uuid(row.try_get("id").map_err(store_err)?),
                name: row.try_get("name").map_err(store_err)?,
                enabled: row.try_get("enabled").map_err(store_err)?,
                created_at: row.try_get("created_at").map_err(store_err)?,
                updated_at: row.try_get("updated_at").map_err(store_err)?,
            })
        })
        .transpose()
    }
}

struct PgOutboxTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxTransaction for PgOutboxTransaction {
    async fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), OutboxError> {
        sqlx::query(
            "INSERT INTO devices (id, name, enabled, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE \
             SET name = EXCLUDED.name, enabled = EXCLUDED.enabled, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(device.id.as_uuid())
        .bind(&device.name)
        .bind(device.enabled)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_device(&mut self, id: DeviceId) -> Result<(), OutboxError> {
        sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn stage_event(&mut self, event: OutboxEvent) -> Result<(), OutboxError> {
        let record = event.into_record();
        insert_record(&mut self.tx, &record).await
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        let this = *self;
        this.tx.commit().await.map_err(store_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        let this = *self;
        this.tx.rollback().await.map_err(store_err)
    }
}
