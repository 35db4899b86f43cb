//! Process-local outbox store.
//!
//! Used by single-process deployments and by the deterministic test
//! pipeline. The whole store is one mutex-guarded state; a transaction
//! stages its writes and applies them under a single lock acquisition, which
//! is what makes the mutation+event commit atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::store::{FailureOutcome, OutboxStore, OutboxTransaction};
use super::{ClaimedEvent, OutboxError, OutboxEvent, OutboxRecord, OutboxStatus};
use crate::devices::DeviceRecord;
use crate::reading::DeviceId;

#[derive(Debug)]
struct StoredRecord {
    record: OutboxRecord,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    records: BTreeMap<u64, StoredRecord>,
    by_id: HashMap<Uuid, u64>,
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl MemoryState {
    fn insert_record(&mut self, mut record: OutboxRecord) {
        self.next_seq += 1;
        record.seq = self.next_seq;
        self.by_id.insert(record.id, record.seq);
        self.records.insert(
            record.seq,
            StoredRecord {
                record,
                claim_token: None,
                claimed_at: None,
            },
        );
    }

    fn by_id_mut(&mut self, id: Uuid) -> Option<&mut StoredRecord> {
        let seq = *self.by_id.get(&id)?;
        self.records.get_mut(&seq)
    }
}

/// In-memory outbox store
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryOutboxStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently in the given status (diagnostics/tests)
    pub async fn count_in_status(&self, status: OutboxStatus) -> usize {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.record.status == status)
            .count()
    }

    /// Number of registered devices (diagnostics/tests)
    pub async fn device_count(&self) -> usize {
        self.state.lock().await.devices.len()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, OutboxError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            device_ops: Vec::new(),
            events: Vec::new(),
        }))
    }

    async fn enqueue(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        self.state.lock().await.insert_record(record);
        Ok(())
    }

    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedEvent>, OutboxError> {
        let mut state = self.state.lock().await;

        // Due Failed records return to Pending before claiming.
        for stored in state.records.values_mut() {
            if stored.record.status == OutboxStatus::Failed
                && stored.record.not_before.map_or(true, |t| t <= now)
            {
                stored.record.status = OutboxStatus::Pending;
            }
        }

        // Only the head of each topic — the oldest non-terminal record — is
        // ever claimable: a record awaiting retry or already claimed blocks
        // its topic's successors, which is what preserves per-topic order.
        let mut heads: HashMap<String, u64> = HashMap::new();
        for (seq, stored) in state.records.iter() {
            if !stored.record.status.is_terminal()
                && !heads.contains_key(&stored.record.topic)
            {
                heads.insert(stored.record.topic.clone(), *seq);
            }
        }
        let mut head_seqs: Vec<u64> = heads.into_values().collect();
        head_seqs.sort_unstable();

        let mut claimed = Vec::new();
        for seq in head_seqs {
            if claimed.len() >= limit {
                break;
            }
            let stored = state.records.get_mut(&seq).expect("seq key exists");
            let due = stored.record.not_before.map_or(true, |t| t <= now);
            if stored.record.status != OutboxStatus::Pending || !due {
                continue;
            }
            let token = Uuid::new_v4();
            stored.record.status = OutboxStatus::Claimed;
            stored.claim_token = Some(token);
            stored.claimed_at = Some(now);
            claimed.push(ClaimedEvent {
                record: stored.record.clone(),
                token,
            });
        }
        if !claimed.is_empty() {
            debug!(worker, count = claimed.len(), "claimed outbox records");
        }
        Ok(claimed)
    }

    async fn mark_dispatched(&self, id: Uuid, token: Uuid) -> Result<bool, OutboxError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.by_id_mut(id) else {
            return Ok(false);
        };
        if stored.record.status != OutboxStatus::Claimed || stored.claim_token != Some(token) {
            return Ok(false);
        }
        stored.record.status = OutboxStatus::Dispatched;
        stored.record.attempts += 1;
        stored.claim_token = None;
        stored.claimed_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        token: Uuid,
        outcome: FailureOutcome,
    ) -> Result<bool, OutboxError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.by_id_mut(id) else {
            return Ok(false);
        };
        if stored.record.status != OutboxStatus::Claimed || stored.claim_token != Some(token) {
            return Ok(false);
        }
        stored.record.attempts += 1;
        stored.record.last_error = Some(outcome.error);
        stored.claim_token = None;
        stored.claimed_at = None;
        match outcome.retry_at {
            Some(at) => {
                stored.record.status = OutboxStatus::Failed;
                stored.record.not_before = Some(at);
            }
            None => {
                stored.record.status = OutboxStatus::DeadLettered;
                stored.record.not_before = None;
            }
        }
        Ok(true)
    }

    async fn recover_expired_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, OutboxError> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for stored in state.records.values_mut() {
            if stored.record.status == OutboxStatus::Claimed
                && stored.claimed_at.map_or(false, |at| at < claimed_before)
            {
                stored.record.status = OutboxStatus::Pending;
                stored.claim_token = None;
                stored.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.record.status == OutboxStatus::DeadLettered)
            .take(limit)
            .map(|r| r.record.clone())
            .collect())
    }

    async fn record(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        let state = self.state.lock().await;
        Ok(state
            .by_id
            .get(&id)
            .and_then(|seq| state.records.get(seq))
            .map(|r| r.record.clone()))
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceRecord>, OutboxError> {
        Ok(self.state.lock().await.devices.get(&id).cloned())
    }
}

#[derive(Debug)]
enum DeviceOp {
    Upsert(DeviceRecord),
    Delete(DeviceId),
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    device_ops: Vec<DeviceOp>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxTransaction for MemoryTransaction {
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
        // Everything applies under one lock acquisition: concurrent readers
        // observe either none of the unit of work or all of it.
        let this = *self;
        let mut state = this.state.lock().await;
        for op in this.device_ops {
            match op {
                DeviceOp::Upsert(device) => {
                    state.devices.insert(device.id, device);
                }
                DeviceOp::Delete(id) => {
                    state.devices.remove(&id);
                }
            }
        }
        for event in this.events {
            state.insert_record(event.into_record());
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), OutboxError> {
        // Nothing was applied; dropping the staged ops is the rollback.
        Ok(())
    }
}
