//! Transactional outbox: durable event records written atomically with the
//! domain mutation that produced them.
//!
//! An [`OutboxRecord`] moves through a small state machine:
//!
//! ```text
//! Pending ──claim──▶ Claimed ──ack──▶ Dispatched        (terminal success)
//!    ▲                  │
//!    │                  ├──fail, attempts < cap──▶ Failed ──due──▶ Pending
//!    └──────────────────┘
//!                       └──fail, attempts ≥ cap──▶ DeadLettered   (terminal)
//! ```
//!
//! Records are never deleted before `Dispatched`; dead-lettered records stay
//! inspectable for operators. Retention afterwards is deployment policy, out
//! of scope here.

mod document;
mod memory;
mod publisher;
mod relational;
mod store;

pub use document::{DocumentOutboxStore, DocumentStoreConfig};
pub use memory::MemoryOutboxStore;
pub use publisher::OutboxPublisher;
pub use relational::RelationalOutboxStore;
pub use store::{FailureOutcome, OutboxStore, OutboxTransaction};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by outbox stores and the publisher
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The backing store rejected or failed the operation
    #[error("Outbox store error: {0}")]
    Store(String),

    /// The store is unreachable
    #[error("Outbox store unavailable: {0}")]
    Unavailable(String),

    /// Event payload or record could not be encoded/decoded
    #[error("Outbox serialization error: {0}")]
    Serialization(String),

    /// The domain mutation inside `publish` failed; nothing was committed
    #[error("Mutation failed: {0}")]
    MutationFailed(String),
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Serialization(err.to_string())
    }
}

/// Delivery status of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Durably recorded, waiting for a dispatch worker
    Pending,
    /// Claimed by a worker; a dispatch attempt is in flight
    Claimed,
    /// Delivered and acknowledged by the transport (terminal)
    Dispatched,
    /// Last attempt failed; scheduled for retry at `not_before`
    Failed,
    /// Attempt cap exhausted; kept for operator inspection (terminal)
    DeadLettered,
}

impl OutboxStatus {
    /// Stable textual form used by the relational store
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Claimed => "claimed",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Parse the textual form
    pub fn parse(s: &str) -> Result<Self, OutboxError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "claimed" => Ok(OutboxStatus::Claimed),
            "dispatched" => Ok(OutboxStatus::Dispatched),
            "failed" => Ok(OutboxStatus::Failed),
            "dead_lettered" => Ok(OutboxStatus::DeadLettered),
            other => Err(OutboxError::Serialization(format!(
                "unknown outbox status `{other}`"
            ))),
        }
    }

    /// Whether the record can never move again
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Dispatched | OutboxStatus::DeadLettered)
    }
}

/// An event handed to the publisher: topic plus serialized body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Topic the event will be dispatched under
    pub topic: String,
    /// Serialized event body
    pub payload: serde_json::Value,
}

impl OutboxEvent {
    /// Serialize `body` into an event for `topic`
    pub fn new<T: Serialize>(topic: impl Into<String>, body: &T) -> Result<Self, OutboxError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_value(body)?,
        })
    }

    /// Turn the draft into a fresh Pending record. The store assigns `seq`
    /// when the record is persisted.
    pub fn into_record(self) -> OutboxRecord {
        OutboxRecord {
            id: Uuid::new_v4(),
            seq: 0,
            topic: self.topic,
            payload: self.payload,
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
            attempts: 0,
            not_before: None,
            last_error: None,
        }
    }
}

/// A durable outbox record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique record id; the platform's only deduplication key
    pub id: Uuid,
    /// Store-assigned sequence establishing creation order
    pub seq: u64,
    /// Topic the event is dispatched under
    pub topic: String,
    /// Serialized event body
    pub payload: serde_json::Value,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Current state-machine position
    pub status: OutboxStatus,
    /// Dispatch attempts so far
    pub attempts: u32,
    /// Earliest instant the next attempt may run (backoff deadline)
    pub not_before: Option<DateTime<Utc>>,
    /// Message of the most recent dispatch failure
    pub last_error: Option<String>,
}

/// A record claimed by a dispatch worker: the record plus the claim token
/// the worker must present when reporting the outcome.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    /// The claimed record, with `status == Claimed`
    pub record: OutboxRecord,
    /// Token proving ownership of the claim
    pub token: Uuid,
}
