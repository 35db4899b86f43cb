//! Broker transport over NATS JetStream.
//!
//! Publishes wait for the broker's acknowledgment, which is what lets the
//! dispatcher mark records `Dispatched`. Delivery to local subscribers runs
//! through one durable pull consumer per process; a handler failure leaves
//! the message unacknowledged, and the broker redelivers it after the ack
//! wait (at-least-once on the consume side as well).

use async_nats::jetstream::consumer::{pull, AckPolicy};
use async_nats::jetstream::{self, stream::StorageType};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::subscriptions::{EventDelivery, SubscriptionRegistry};
use super::transport::{EventTransport, TransportError};
use crate::nats::NatsClient;

/// Configuration for the JetStream transport
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    /// Stream carrying dispatched events
    pub stream_name: String,
    /// Subject prefix events are published under
    pub subject_prefix: String,
    /// Durable consumer name for this process group
    pub consumer_name: String,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            stream_name: "telemetry-events".to_string(),
            subject_prefix: "evt".to_string(),
            consumer_name: "telemetry-dispatch".to_string(),
        }
    }
}

/// JetStream-backed event transport
#[derive(Debug)]
pub struct NatsTransport {
    client: NatsClient,
    config: NatsTransportConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NatsTransport {
    /// Create the transport and its stream if missing.
    pub async fn new(
        client: NatsClient,
        config: NatsTransportConfig,
    ) -> Result<Self, TransportError> {
        let stream_config = jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![format!("{}.>", config.subject_prefix)],
            storage: StorageType::File,
            ..Default::default()
        };
        client
            .jetstream()
            .create_stream(stream_config)
            .await
            .map_err(|e| TransportError::Connection(format!("failed to create stream: {e}")))?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            config,
            shutdown,
            task: Mutex::new(None),
        })
    }

    async fn consume(
        client: NatsClient,
        config: NatsTransportConfig,
        registry: Arc<SubscriptionRegistry>,
    ) -> Result<(), TransportError> {
        let stream = client
            .jetstream()
            .get_stream(&config.stream_name)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        // Creating an existing durable with the same config is idempotent.
        let consumer = stream
            .create_consumer(pull::Config {
                durable_name: Some(config.consumer_name.clone()),
                ack_policy: AckPolicy::Explicit,
                filter_subject: format!("{}.>", config.subject_prefix),
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        info!(consumer = %config.consumer_name, "event consumer running");
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| TransportError::Connection(e.to_string()))?;
            let delivery: EventDelivery = match serde_json::from_slice(&message.payload) {
                Ok(delivery) => delivery,
                Err(err) => {
                    // Undecodable payloads would redeliver forever; drop them
                    // with a trace instead.
                    warn!(%err, "discarding undecodable event payload");
                    let _ = message.ack().await;
                    continue;
                }
            };

            match registry.dispatch(&delivery).await {
                Ok(matched) => {
                    debug!(topic = %delivery.topic, matched, "event delivered");
                    if let Err(err) = message.ack().await {
                        warn!(%err, "event ack failed; broker will redeliver");
                    }
                }
                Err(err) => {
                    // No ack: the broker redelivers after the ack wait.
                    warn!(topic = %delivery.topic, %err, "handler failed; leaving event unacked");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventTransport for NatsTransport {
    async fn start(&self, registry: Arc<SubscriptionRegistry>) -> Result<(), TransportError> {
        let client = self.client.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = Self::consume(client.clone(), config.clone(), registry.clone()) => {
                        match result {
                            Ok(()) => debug!("event consumer stream ended; reconnecting"),
                            Err(err) => warn!(%err, "event consumer failed; reconnecting"),
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn publish(&self, delivery: &EventDelivery) -> Result<(), TransportError> {
        let subject = format!("{}.{}", self.config.subject_prefix, delivery.topic);
        let payload = Bytes::from(
            serde_json::to_vec(delivery)
                .map_err(|e| TransportError::Serialization(e.to_string()))?,
        );
        self.client
            .jetstream()
            .publish(subject, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
