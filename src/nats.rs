//! NATS connection shared by the time-series storage engine, the document
//! outbox store, and the broker transport.

use async_nats::jetstream::{self, Context as JetStreamContext};
use async_nats::{Client, ConnectOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that can occur when working with NATS
#[derive(Debug, Error)]
pub enum NatsError {
    /// Failed to establish connection to the NATS server
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Error occurred in JetStream operations
    #[error("JetStream error: {0}")]
    JetStreamError(String),
}

/// Configuration for a NATS connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g. "nats://localhost:4222")
    pub url: String,

    /// Optional username for authentication
    pub user: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
}

impl NatsConfig {
    /// Configuration for a plain unauthenticated endpoint
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            user: None,
            password: None,
            connection_timeout_secs: 10,
        }
    }
}

/// NATS client wrapper with a JetStream context.
///
/// async-nats handles reconnection internally; the platform's delivery
/// guarantees do not depend on an unbroken connection, only on the outbox
/// redelivery loop.
#[derive(Debug, Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: JetStreamContext,
}

impl NatsClient {
    /// Connect to a NATS server with the provided configuration
    pub async fn connect(config: NatsConfig) -> Result<Self, NatsError> {
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => warn!("NATS disconnected"),
                    async_nats::Event::Connected => info!("NATS connected"),
                    async_nats::Event::ClientError(err) => error!("NATS client error: {err}"),
                    _ => {}
                }
            });

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        }

        let client = options.connect(&config.url).await.map_err(|e| {
            NatsError::ConnectionFailed(format!("Failed to connect to {}: {}", config.url, e))
        })?;

        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// The underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The JetStream context
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Round-trip connectivity probe
    pub async fn ping(&self) -> Result<(), NatsError> {
        self.client
            .flush()
            .await
            .map_err(|e| NatsError::ConnectionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_localhost() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.connection_timeout_secs, 10);
    }

    #[test]
    fn from_url_keeps_defaults() {
        let config = NatsConfig::from_url("nats://broker:4222");
        assert_eq!(config.url, "nats://broker:4222");
        assert!(config.user.is_none());
    }
}
