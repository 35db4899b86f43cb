//! The publisher: one logical transaction for a domain mutation and its
//! outbox record.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::store::{OutboxStore, OutboxTransaction};
use super::{OutboxError, OutboxEvent};

/// Boxed async mutation run inside the store's unit of work.
pub type Mutation<'t, T> = BoxFuture<'t, Result<T, OutboxError>>;

/// Couples domain mutations with durable event enqueues.
///
/// The core guarantee: if [`publish`](OutboxPublisher::publish) returns
/// `Ok`, the mutation's effect and a Pending outbox record both exist and
/// the record will eventually be dispatched at least once; if it returns
/// `Err`, neither exists.
#[derive(Debug, Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
}

impl OutboxPublisher {
    /// Publisher over the selected outbox store
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Run `mutation` and stage `event` as a single unit of work.
    ///
    /// The mutation receives the open [`OutboxTransaction`] and performs its
    /// domain writes through it; the event is staged afterwards and the unit
    /// commits. Any failure — mutation, staging, or commit — leaves no
    /// visible effect.
    #[instrument(skip(self, event, mutation), fields(topic = %event.topic))]
    pub async fn publish<T, F>(&self, event: OutboxEvent, mutation: F) -> Result<T, OutboxError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn OutboxTransaction) -> Mutation<'t, T> + Send,
    {
        let mut tx = self.store.begin().await?;

        let value = match mutation(tx.as_mut()).await {
            Ok(value) => value,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err);
            }
        };

        if let Err(err) = tx.stage_event(event).await {
            let _ = tx.rollback().await;
            return Err(err);
        }

        tx.commit().await?;
        debug!("mutation and outbox record committed");
        Ok(value)
    }

    /// Durably enqueue an event with no accompanying mutation.
    pub async fn publish_event(&self, event: OutboxEvent) -> Result<(), OutboxError> {
        self.store.enqueue(event.into_record()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceRecord;
    use crate::outbox::{MemoryOutboxStore, OutboxStatus};

    fn publisher() -> (OutboxPublisher, MemoryOutboxStore) {
        let store = MemoryOutboxStore::new();
        (OutboxPublisher::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn success_commits_mutation_and_record_together() {
        let (publisher, store) = publisher();
        let device = DeviceRecord::new("boiler-7");
        let event = OutboxEvent::new("device.created", &serde_json::json!({"n": 1})).unwrap();

        let id = publisher
            .publish(event, {
                let device = device.clone();
                move |tx| {
                    Box::pin(async move {
                        tx.upsert_device(&device).await?;
                        Ok(device.id)
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(id, device.id);
        assert_eq!(store.device_count().await, 1);
        assert_eq!(store.count_in_status(OutboxStatus::Pending).await, 1);
    }

    #[tokio::test]
    async fn mutation_failure_leaves_nothing_behind() {
        let (publisher, store) = publisher();
        let device = DeviceRecord::new("boiler-7");
        let event = OutboxEvent::new("device.created", &serde_json::json!({"n": 1})).unwrap();

        let result: Result<(), _> = publisher
            .publish(event, move |tx| {
                Box::pin(async move {
                    // A write lands before the mutation aborts mid-way.
                    tx.upsert_device(&device).await?;
                    Err(OutboxError::MutationFailed("validation failed".to_string()))
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.device_count().await, 0);
        assert_eq!(store.count_in_status(OutboxStatus::Pending).await, 0);
    }

    #[tokio::test]
    async fn publish_event_enqueues_without_mutation() {
        let (publisher, store) = publisher();
        publisher
            .publish_event(OutboxEvent::new("telemetry.ingested", &serde_json::json!({})).unwrap())
            .await
            .unwrap();
        assert_eq!(store.count_in_status(OutboxStatus::Pending).await, 1);
        assert_eq!(store.device_count().await, 0);
    }
}
