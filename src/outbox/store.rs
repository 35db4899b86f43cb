//! Outbox store and unit-of-work contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use super::{ClaimedEvent, OutboxError, OutboxEvent, OutboxRecord};
use crate::devices::DeviceRecord;
use crate::reading::DeviceId;

/// Outcome a worker reports for a failed dispatch attempt.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    /// What went wrong
    pub error: String,
    /// When to retry; `None` dead-letters the record
    pub retry_at: Option<DateTime<Utc>>,
}

/// Storage backend for outbox records and the co-located domain rows.
///
/// The claim path is the one concurrency-sensitive spot: `claim_due` performs
/// an atomic conditional transition (Pending → Claimed with a fresh token),
/// and `mark_*` only succeed while the presented token still owns the claim.
/// Losing either race returns `false` — the loser skips the record, it is
/// not an error.
#[async_trait]
pub trait OutboxStore: Send + Sync + fmt::Debug {
    /// Open a unit of work covering the domain rows and the outbox
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError>;

    /// Durably insert a Pending record outside any domain mutation
    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxError>;

    /// Claim due records for dispatch.
    ///
    /// Sweeps due `Failed` records back to `Pending` first, then claims at
    /// most one record per topic (the oldest by `seq`, and only for topics
    /// with no claim in flight) — this is what preserves per-topic dispatch
    /// order under concurrent workers.
    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedEvent>, OutboxError>;

    /// Transition a claimed record to `Dispatched`. Returns `false` when the
    /// token no longer owns the claim.
    async fn mark_dispatched(&self, id: Uuid, token: Uuid) -> Result<bool, OutboxError>;

    /// Record a failed attempt: bump `attempts`, then either schedule a
    /// retry (`retry_at`) or dead-letter. Returns `false` when the token no
    /// longer owns the claim.
    async fn mark_failed(
        &self,
        id: Uuid,
        token: Uuid,
        outcome: FailureOutcome,
    ) -> Result<bool, OutboxError>;

    /// Release claims abandoned before `claimed_before` back to `Pending`
    /// (worker crash or shutdown mid-dispatch); returns how many were
    /// released. Redelivery after this is the at-least-once contract at
    /// work.
    async fn recover_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, OutboxError>;

    /// Dead-lettered records, oldest first, for the operator listing
    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Fetch one record by id
    async fn record(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError>;

    /// Read a co-located device registry row
    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, OutboxError>;
}

/// One unit of work: domain writes staged together with outbox records,
/// committed atomically or not at all.
#[async_trait]
pub trait OutboxTransaction: Send {
    /// Stage a device registry upsert
    async fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), OutboxError>;

    /// Stage a device registry deletion
    async fn delete_device(&mut self, id: DeviceId) -> Result<(), OutboxError>;

    /// Stage an outbox record for this unit of work
    async fn stage_event(&mut self, event: OutboxEvent) -> Result<(), OutboxError>;

    /// Commit everything staged
    async fn commit(self: Box<Self>) -> Result<(), OutboxError>;

    /// Discard everything staged
    async fn rollback(self: Box<Self>) -> Result<(), OutboxError>;
}
