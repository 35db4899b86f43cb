//! Document outbox store over a NATS KV bucket.
//!
//! The bucket holds four kinds of documents: `catalog` (sequence counter,
//! live record ids, in-flight commit ids — the store's single CAS-updated
//! root), `rec.<id>` records, `dev.<id>` device rows, and `commit.<id>`
//! commit documents.
//!
//! KV offers no multi-key transaction, so a unit of work becomes durable as
//! ONE `commit.<id>` put and is then unpacked into its per-record keys; a
//! crash mid-unpack is healed by `recover`, which re-applies any commit
//! document still referenced by the catalog (create-only, so records that
//! already progressed are not clobbered — redelivery after such a crash is
//! the at-least-once contract, not a defect).
//!
//! Claims use the KV revision as the compare-and-set: the worker that loses
//! the `update` race simply skips the record.

use async_nats::jetstream::kv::{self, Store};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{FailureOutcome, OutboxStore, OutboxTransaction};
use super::{ClaimedEvent, OutboxError, OutboxEvent, OutboxRecord, OutboxStatus};
use crate::devices::DeviceRecord;
use crate::nats::{NatsClient, NatsConfig};
use crate::reading::DeviceId;

const CATALOG_KEY: &str = "catalog";
const CAS_ATTEMPTS: usize = 16;

/// Configuration for the document store
#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    /// KV bucket name
    pub bucket: String,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            bucket: "outbox".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Catalog {
    next_seq: u64,
    ids: Vec<Uuid>,
    pending_commits: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordDoc {
    record: OutboxRecord,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum DeviceOp {
    Upsert(DeviceRecord),
    Delete(DeviceId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitDoc {
    device_ops: Vec<DeviceOp>,
    records: Vec<OutboxRecord>,
}

fn rec_key(id: Uuid) -> String {
    format!("rec.{id}")
}

fn dev_key(id: DeviceId) -> String {
    format!("dev.{id}")
}

fn commit_key(id: Uuid) -> String {
    format!("commit.{id}")
}

fn kv_err(err: impl std::fmt::Display) -> OutboxError {
    OutboxError::Unavailable(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, OutboxError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// NATS KV-backed outbox store
#[derive(Clone)]
pub struct DocumentOutboxStore {
    client: NatsClient,
    kv: Store,
}

impl std::fmt::Debug for DocumentOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentOutboxStore").finish_non_exhaustive()
    }
}

impl DocumentOutboxStore {
    /// Connect to the endpoint, create the bucket if needed, and heal any
    /// interrupted commits.
    pub async fn connect(endpoint: &str) -> Result<Self, OutboxError> {
        let client = NatsClient::connect(NatsConfig::from_url(endpoint))
            .await
            .map_err(kv_err)?;
        Self::with_client(client, DocumentStoreConfig::default()).await
    }

    /// Store over an existing connection
    pub async fn with_client(
        client: NatsClient,
        config: DocumentStoreConfig,
    ) -> Result<Self, OutboxError> {
        let kv = client
            .jetstream()
            .create_key_value(kv::Config {
                bucket: config.bucket.clone(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| kv_err(format!("failed to create bucket {}: {e}", config.bucket)))?;
        let store = Self { client, kv };
        store.recover().await?;
        Ok(store)
    }

    /// One connectivity round-trip
    pub async fn ping(&self) -> Result<(), OutboxError> {
        self.client.ping().await.map_err(kv_err)
    }

    async fn read_catalog(&self) -> Result<(Catalog, u64), OutboxError> {
        match self.kv.entry(CATALOG_KEY).await.map_err(kv_err)? {
            Some(entry) if !entry.value.is_empty() => {
                Ok((serde_json::from_slice(&entry.value)?, entry.revision))
            }
            _ => Ok((Catalog::default(), 0)),
        }
    }

    /// CAS-update the catalog through `change`; retries on revision races.
    async fn update_catalog<F>(&self, mut change: F) -> Result<Catalog, OutboxError>
    where
        F: FnMut(&mut Catalog),
    {
        for _ in 0..CAS_ATTEMPTS {
            let (mut catalog, revision) = self.read_catalog().await?;
            change(&mut catalog);
            let bytes = encode(&catalog)?;
            match self.kv.update(CATALOG_KEY, bytes, revision).await {
                Ok(_) => return Ok(catalog),
                Err(err) => {
                    debug!(%err, "catalog update raced, retrying");
                }
            }
        }
        Err(OutboxError::Store(
            "catalog update kept racing; giving up".to_string(),
        ))
    }

    async fn read_record(&self, id: Uuid) -> Result<Option<(RecordDoc, u64)>, OutboxError> {
        match self.kv.entry(&rec_key(id)).await.map_err(kv_err)? {
            Some(entry) if !entry.value.is_empty() => {
                Ok(Some((serde_json::from_slice(&entry.value)?, entry.revision)))
            }
            _ => Ok(None),
        }
    }

    /// CAS a record document; `false` means the revision moved under us.
    async fn swap_record(
        &self,
        id: Uuid,
        doc: &RecordDoc,
        revision: u64,
    ) -> Result<bool, OutboxError> {
        let bytes = encode(doc)?;
        Ok(self.kv.update(rec_key(id), bytes, revision).await.is_ok())
    }

    async fn apply_unit(&self, unit: &CommitDoc, create_only: bool) -> Result<(), OutboxError> {
        for op in &unit.device_ops {
            match op {
                DeviceOp::Upsert(device) => {
                    self.kv
                        .put(dev_key(device.id), encode(device)?)
                        .await
                        .map_err(kv_err)?;
                }
                DeviceOp::Delete(id) => {
                    self.kv.delete(dev_key(*id)).await.map_err(kv_err)?;
                }
            }
        }
        for record in &unit.records {
            let doc = RecordDoc {
                record: record.clone(),
                claim_token: None,
                claimed_at: None,
            };
            let bytes = encode(&doc)?;
            if create_only {
                // Revision 0 means create-only: a record that already exists
                // (and may have progressed past Pending) is left alone.
                if self.kv.update(rec_key(record.id), bytes, 0).await.is_err() {
                    debug!(id = %record.id, "record already applied, skipping");
                }
            } else {
                self.kv.put(rec_key(record.id), bytes).await.map_err(kv_err)?;
            }
        }
        Ok(())
    }

    /// Make a unit of work durable and unpack it.
    async fn commit_unit(
        &self,
        device_ops: Vec<DeviceOp>,
        mut records: Vec<OutboxRecord>,
    ) -> Result<(), OutboxError> {
        let commit_id = Uuid::new_v4();

        // Allocate sequence numbers and register the unit in one catalog CAS.
        let record_ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let count = records.len() as u64;
        let catalog = self
            .update_catalog(|catalog| {
                catalog.next_seq += count;
                for id in &record_ids {
                    if !catalog.ids.contains(id) {
                        catalog.ids.push(*id);
                    }
                }
                if !catalog.pending_commits.contains(&commit_id) {
                    catalog.pending_commits.push(commit_id);
                }
            })
            .await?;
        let base = catalog.next_seq - count;
        for (offset, record) in records.iter_mut().enumerate() {
            record.seq = base + offset as u64 + 1;
        }

        let unit = CommitDoc {
            device_ops,
            records,
        };

        // The unit becomes durable with this single put.
        self.kv
            .put(commit_key(commit_id), encode(&unit)?)
            .await
            .map_err(kv_err)?;

        self.apply_unit(&unit, false).await?;

        self.update_catalog(|catalog| {
            catalog.pending_commits.retain(|id| *id != commit_id);
        })
        .await?;
        self.kv.delete(commit_key(commit_id)).await.map_err(kv_err)?;
        Ok(())
    }

    /// Re-apply commit documents an earlier process left behind.
    async fn recover(&self) -> Result<(), OutboxError> {
        let (catalog, _) = self.read_catalog().await?;
        if catalog.pending_commits.is_empty() {
            return Ok(());
        }
        info!(
            count = catalog.pending_commits.len(),
            "recovering interrupted outbox commits"
        );
        for commit_id in catalog.pending_commits.clone() {
            match self.kv.get(&commit_key(commit_id)).await.map_err(kv_err)? {
                Some(bytes) => {
                    let unit: CommitDoc = serde_json::from_slice(&bytes)?;
                    self.apply_unit(&unit, true).await?;
                    self.kv.delete(commit_key(commit_id)).await.map_err(kv_err)?;
                }
                // Registered but never written: the unit never became
                // durable, there is nothing to heal.
                None => debug!(%commit_id, "commit registered but absent, dropping"),
            }
            self.update_catalog(|catalog| {
                catalog.pending_commits.retain(|id| *id != commit_id);
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for DocumentOutboxStore {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        Ok(Box::new(DocumentTransaction {
            store: self.clone(),
            device_ops: Vec::new(),
            events: Vec::new(),
        }))
    }

    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        // Route through the commit protocol so sequence allocation and
        // catalog registration stay uniform.
        self.commit_unit(Vec::new(), vec![record]).await
    }

    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        let (catalog, _) = self.read_catalog().await?;

        // Load the live records in sequence order.
        let mut docs = Vec::new();
        for id in &catalog.ids {
            if let Some((doc, revision)) = self.read_record(*id).await? {
                docs.push((doc, revision));
            }
        }
        docs.sort_by_key(|(doc, _)| doc.record.seq);

        // Sweep due Failed records back to Pending (best effort; a racing
        // worker doing the same sweep is harmless). The claim below re-reads
        // each candidate, so stale revisions here only cost a skipped claim.
        for (doc, revision) in &mut docs {
            let due = doc.record.not_before.map_or(true, |t| t <= now);
            if doc.record.status == OutboxStatus::Failed && due {
                doc.record.status = OutboxStatus::Pending;
                if !self.swap_record(doc.record.id, doc, *revision).await? {
                    doc.record.status = OutboxStatus::Failed;
                }
            }
        }

        // Only each topic's head — its oldest non-terminal record — is a
        // candidate: a record awaiting retry or already claimed blocks its
        // topic's successors, preserving per-topic order.
        let mut seen_topics = std::collections::HashSet::new();
        let mut claimed = Vec::new();
        for (doc, _) in docs {
            if claimed.len() >= limit {
                break;
            }
            if doc.record.status.is_terminal() || !seen_topics.insert(doc.record.topic.clone()) {
                continue;
            }
            let due = doc.record.not_before.map_or(true, |t| t <= now);
            if doc.record.status != OutboxStatus::Pending || !due {
                continue;
            }

            // Re-read for a fresh revision, then CAS the claim in; losing
            // the race just skips the record.
            let Some((mut fresh, fresh_rev)) = self.read_record(doc.record.id).await? else {
                continue;
            };
            if fresh.record.status != OutboxStatus::Pending {
                continue;
            }
            let token = Uuid::new_v4();
            fresh.record.status = OutboxStatus::Claimed;
            fresh.claim_token = Some(token);
            fresh.claimed_at = Some(now);
            if self.swap_record(fresh.record.id, &fresh, fresh_rev).await? {
                claimed.push(ClaimedEvent {
                    record: fresh.record,
                    token,
                });
            }
        }
        if !claimed.is_empty() {
            debug!(worker, count = claimed.len(), "claimed outbox records");
        }
        Ok(claimed)
    }

    async fn mark_dispatched(&self, id: Uuid, token: Uuid) -> Result<bool, OutboxError> {
        let Some((mut doc, revision)) = self.read_record(id).await? else {
            return Ok(false);
        };
        if doc.record.status != OutboxStatus::Claimed || doc.claim_token != Some(token) {
            return Ok(false);
        }
        doc.record.status = OutboxStatus::Dispatched;
        doc.record.attempts += 1;
        doc.claim_token = None;
        doc.claimed_at = None;
        if !self.swap_record(id, &doc, revision).await? {
            return Ok(false);
        }
        // Dispatched records leave the live catalog (the documents stay for
        // audit); this is what keeps claim scans bounded.
        self.update_catalog(|catalog| {
            catalog.ids.retain(|rid| *rid != id);
        })
        .await?;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        token: Uuid,
        outcome: FailureOutcome,
    ) -> Result<bool, OutboxError> {
        let Some((mut doc, revision)) = self.read_record(id).await? else {
            return Ok(false);
        };
        if doc.record.status != OutboxStatus::Claimed || doc.claim_token != Some(token) {
            return Ok(false);
        }
        doc.record.attempts += 1;
        doc.record.last_error = Some(outcome.error);
        doc.claim_token = None;
        doc.claimed_at = None;
        match outcome.retry_at {
            Some(at) => {
                doc.record.status = OutboxStatus::Failed;
                doc.record.not_before = Some(at);
            }
            None => {
                doc.record.status = OutboxStatus::DeadLettered;
                doc.record.not_before = None;
                warn!(%id, topic = %doc.record.topic, "outbox record dead-lettered");
            }
        }
        self.swap_record(id, &doc, revision).await
    }

    async fn recover_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, OutboxError> {
        let (catalog, _) = self.read_catalog().await?;
        let mut released = 0;
        for id in &catalog.ids {
            let Some((mut doc, revision)) = self.read_record(*id).await? else {
                continue;
            };
            if doc.record.status == OutboxStatus::Claimed
                && doc.claimed_at.map_or(false, |at| at < claimed_before)
            {
                doc.record.status = OutboxStatus::Pending;
                doc.claim_token = None;
                doc.claimed_at = None;
                if self.swap_record(*id, &doc, revision).await? {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let (catalog, _) = self.read_catalog().await?;
        let mut letters = Vec::new();
        for id in &catalog.ids {
            if let Some((doc, _)) = self.read_record(*id).await? {
                if doc.record.status == OutboxStatus::DeadLettered {
                    letters.push(doc.record);
                }
            }
        }
        letters.sort_by_key(|r| r.seq);
        letters.truncate(limit);
        Ok(letters)
    }

    async fn record(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self.read_record(id).await?.map(|(doc, _)| doc.record))
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, OutboxError> {
        match self.kv.get(&dev_key(id)).await.map_err(kv_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

struct DocumentTransaction {
    store: DocumentOutboxStore,
    device_ops: Vec<DeviceOp>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxTransaction for DocumentTransaction {
    async fn upsert_device(&mut self, device: &DeviceRecord) -> Result<(), OutboxError> {
        self.device_ops.push(DeviceOp::Upsert(device.clone()));
        Ok(())
    }

    async fn delete_device(&mut self, id: DeviceId) -> Result<(), OutboxError> {
        self.device_ops.push(DeviceOp::Delete(id));
        Ok(())
    }

    async fn stage_event(&mut self, event: OutboxEvent) -> Result<(), OutboxError> {
        self.events.push(event);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        let this = *self;
        let records: Vec<OutboxRecord> = this
            .events
            .into_iter()
            .map(OutboxEvent::into_record)
            .collect();
        this.store.commit_unit(this.device_ops, records).await
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        // Nothing touched the bucket yet; dropping the staged ops suffices.
        Ok(())
    }
}
