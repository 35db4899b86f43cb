//! In-process transport: dispatch straight into the subscriber registry.
//!
//! "Acknowledgment" here is the handlers themselves succeeding, so a handler
//! failure fails the publish and feeds the outbox retry loop — which is
//! exactly what gives single-process deployments handler-level at-least-once
//! semantics.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::trace;

use super::subscriptions::{EventDelivery, SubscriptionRegistry};
use super::transport::{EventTransport, TransportError};

/// Direct in-process dispatch transport
#[derive(Debug, Default)]
pub struct InProcessTransport {
    registry: RwLock<Option<Arc<SubscriptionRegistry>>>,
}

impl InProcessTransport {
    /// A transport with no registry bound yet
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventTransport for InProcessTransport {
    async fn start(&self, registry: Arc<SubscriptionRegistry>) -> Result<(), TransportError> {
        *self.registry.write().expect("transport registry poisoned") = Some(registry);
        Ok(())
    }

    async fn publish(&self, delivery: &EventDelivery) -> Result<(), TransportError> {
        let registry = self
            .registry
            .read()
            .expect("transport registry poisoned")
            .clone()
            .ok_or(TransportError::NotStarted)?;

        let matched = registry
            .dispatch(delivery)
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        trace!(topic = %delivery.topic, matched, "delivered in process");
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::subscriptions::{EventHandler, HandlerError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Recorder(AtomicUsize);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _delivery: &EventDelivery) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery() -> EventDelivery {
        EventDelivery {
            record_id: Uuid::new_v4(),
            topic: "device.created".to_string(),
            payload: serde_json::json!({}),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let transport = InProcessTransport::new();
        assert!(matches!(
            transport.publish(&delivery()).await,
            Err(TransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn publish_invokes_matching_handlers() {
        let transport = InProcessTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        registry.subscribe("device.*", recorder.clone()).unwrap();

        transport.start(registry).await.unwrap();
        transport.publish(&delivery()).await.unwrap();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }
}
