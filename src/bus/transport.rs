//! Transport contract: how dispatched events reach subscribers.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::subscriptions::{EventDelivery, SubscriptionRegistry};

/// Errors surfaced by event transports
#[derive(Debug, Error)]
pub enum TransportError {
    /// `publish` was called before `start`
    #[error("Transport not started")]
    NotStarted,

    /// Broker connection problem
    #[error("Transport connection error: {0}")]
    Connection(String),

    /// The transport did not acknowledge the publish
    #[error("Transport publish failed: {0}")]
    Publish(String),

    /// A subscribed handler rejected the delivery
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Payload could not be encoded or decoded
    #[error("Transport serialization error: {0}")]
    Serialization(String),
}

/// Carries dispatched events from the outbox to subscribers.
///
/// `publish` must not return `Ok` until the transport has acknowledged the
/// event: the dispatcher marks the record `Dispatched` on that return, and
/// an unacknowledged `Ok` would break the at-least-once guarantee.
#[async_trait]
pub trait EventTransport: Send + Sync + fmt::Debug {
    /// Bind the subscriber registry and start delivering. Called once,
    /// after all startup subscriptions are registered.
    async fn start(&self, registry: Arc<SubscriptionRegistry>) -> Result<(), TransportError>;

    /// Hand one delivery to the transport and wait for its acknowledgment
    async fn publish(&self, delivery: &EventDelivery) -> Result<(), TransportError>;

    /// Stop delivering; in-flight work is abandoned (reprocessed on restart)
    async fn shutdown(&self);
}
