//! The event bus: an outbox store composed with a transport behind one
//! publish/subscribe contract.
//!
//! [`select`] is the EventBusSelector: it reads the store and transport
//! kinds from settings, builds each backend, and assembles the [`EventBus`]
//! that owns the subscriber registry and the dispatcher. The store × transport
//! pairing is orthogonal — any store may pair with any transport — and fixed
//! for the process lifetime.

pub mod dispatcher;
pub mod in_process;
pub mod nats;
pub mod subscriptions;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use in_process::InProcessTransport;
pub use nats::{NatsTransport, NatsTransportConfig};
pub use subscriptions::{
    EventDelivery, EventHandler, FnHandler, HandlerError, IdempotentHandler,
    SubscriptionRegistry, TopicPattern,
};
pub use transport::{EventTransport, TransportError};

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::PlatformError;
use crate::nats::{NatsClient, NatsConfig};
use crate::outbox::{
    DocumentOutboxStore, MemoryOutboxStore, OutboxError, OutboxEvent, OutboxPublisher,
    OutboxRecord, OutboxStore, RelationalOutboxStore,
};
use crate::settings::{
    ConfigurationError, EventBusSettings, EventBusStoreKind, EventBusTransportKind,
};

/// Build the event bus selected by `settings`.
///
/// Fails with [`ConfigurationError`] on a missing endpoint before any I/O;
/// an unreachable store or broker is
/// [`BackendUnavailable`](PlatformError::BackendUnavailable) and
/// startup-fatal.
pub async fn select(settings: &EventBusSettings) -> Result<EventBus, PlatformError> {
    settings.validate()?;

    let store: Arc<dyn OutboxStore> = match settings.store {
        EventBusStoreKind::Relational => {
            let endpoint = settings.store_endpoint.as_deref().unwrap_or_default();
            Arc::new(
                RelationalOutboxStore::connect(endpoint)
                    .await
                    .map_err(|e| store_unavailable("postgres", e))?,
            )
        }
        EventBusStoreKind::Document => {
            let endpoint = settings.store_endpoint.as_deref().unwrap_or_default();
            Arc::new(
                DocumentOutboxStore::connect(endpoint)
                    .await
                    .map_err(|e| store_unavailable("nats-kv", e))?,
            )
        }
        EventBusStoreKind::InMemory => Arc::new(MemoryOutboxStore::new()),
    };

    let transport: Arc<dyn EventTransport> = match settings.transport {
        EventBusTransportKind::Nats => {
            let endpoint = settings.transport_endpoint.as_deref().unwrap_or_default();
            let client = NatsClient::connect(NatsConfig::from_url(endpoint))
                .await
                .map_err(|e| PlatformError::BackendUnavailable {
                    backend: "nats",
                    reason: e.to_string(),
                })?;
            Arc::new(
                NatsTransport::new(client, NatsTransportConfig::default())
                    .await
                    .map_err(|e| PlatformError::BackendUnavailable {
                        backend: "nats",
                        reason: e.to_string(),
                    })?,
            )
        }
        EventBusTransportKind::InProcess => Arc::new(InProcessTransport::new()),
    };

    info!(store = ?settings.store, transport = ?settings.transport, "event bus selected");
    Ok(EventBus::compose(store, transport, settings.clone()))
}

fn store_unavailable(backend: &'static str, err: OutboxError) -> PlatformError {
    PlatformError::BackendUnavailable {
        backend,
        reason: err.to_string(),
    }
}

/// The composed event bus: durable publish through the outbox, pattern
/// subscriptions, and the dispatch workers that connect the two.
#[derive(Debug)]
pub struct EventBus {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn EventTransport>,
    registry: Arc<SubscriptionRegistry>,
    publisher: Arc<OutboxPublisher>,
    dispatcher: Mutex<Dispatcher>,
}

impl EventBus {
    /// Compose a bus from an explicit store and transport.
    pub fn compose(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn EventTransport>,
        settings: EventBusSettings,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let publisher = Arc::new(OutboxPublisher::new(store.clone()));
        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), settings.dispatch);
        Self {
            store,
            transport,
            registry,
            publisher,
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// The outbox publisher for mutation+event pairs
    pub fn publisher(&self) -> Arc<OutboxPublisher> {
        self.publisher.clone()
    }

    /// The underlying outbox store
    pub fn store(&self) -> Arc<dyn OutboxStore> {
        self.store.clone()
    }

    /// Durably enqueue an event; it will be dispatched at least once.
    pub async fn publish<T: Serialize>(&self, topic: &str, body: &T) -> Result<(), OutboxError> {
        self.publisher
            .publish_event(OutboxEvent::new(topic, body)?)
            .await
    }

    /// Register a handler for every topic matching `pattern`. Registration
    /// happens during startup; the subscription set is append-only.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConfigurationError> {
        self.registry.subscribe(pattern, handler)
    }

    /// Register an async closure as a handler.
    pub fn subscribe_fn<F, Fut>(&self, pattern: &str, f: F) -> Result<(), ConfigurationError>
    where
        F: Fn(EventDelivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.subscribe(pattern, Arc::new(FnHandler::new(f)))
    }

    /// Best-effort channel tap on a pattern, for dashboards and tooling.
    ///
    /// Unlike a durable handler, a slow consumer loses deliveries rather
    /// than blocking its topic.
    pub fn subscribe_stream(
        &self,
        pattern: &str,
    ) -> Result<ReceiverStream<EventDelivery>, ConfigurationError> {
        let (tx, rx) = mpsc::channel(256);
        struct Tap {
            tx: mpsc::Sender<EventDelivery>,
        }
        #[async_trait::async_trait]
        impl EventHandler for Tap {
            async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError> {
                match self.tx.try_send(delivery.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic = %delivery.topic, "stream tap lagging; delivery dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
                Ok(())
            }
        }
        self.registry.subscribe(pattern, Arc::new(Tap { tx }))?;
        Ok(ReceiverStream::new(rx))
    }

    /// Bind the registry to the transport and start the dispatch workers.
    /// Call after all startup subscriptions are registered.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.start(self.registry.clone()).await?;
        self.dispatcher.lock().await.start();
        Ok(())
    }

    /// One deterministic dispatch cycle (tests, cron-style deployments)
    pub async fn run_dispatch_once(&self, worker: &str) -> Result<usize, OutboxError> {
        self.dispatcher.lock().await.run_once(worker).await
    }

    /// Dead-lettered records, oldest first — the operator listing.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.store.dead_letters(limit).await
    }

    /// Fetch one outbox record by id
    pub async fn outbox_record(&self, id: Uuid) -> Result<Option<OutboxRecord>, OutboxError> {
        self.store.record(id).await
    }

    /// Stop dispatch workers and the transport. In-flight attempts are
    /// abandoned and reprocessed after restart.
    pub async fn shutdown(&self) {
        self.dispatcher.lock().await.shutdown().await;
        self.transport.shutdown().await;
    }
}
