//! Subscriber registry: topic patterns, handlers, and the idempotency
//! helper.
//!
//! Subscriptions are registered during startup and the set is append-only
//! afterwards; there is no dynamic unsubscription.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::settings::ConfigurationError;

/// One delivered event as seen by a handler.
///
/// Delivery is at-least-once: the same record id may be observed more than
/// once, and handlers are required to be idempotent. The platform
/// deduplicates only by `record_id` for its own bookkeeping, never by
/// payload content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDelivery {
    /// Outbox record id; the only deduplication key
    pub record_id: Uuid,
    /// Topic the event was published under
    pub topic: String,
    /// Serialized event body
    pub payload: serde_json::Value,
    /// 1-based dispatch attempt that produced this delivery
    pub attempt: u32,
}

/// Error returned by a handler; any failure triggers redelivery.
#[derive(Debug, Clone, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Wrap any displayable error
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// A subscribed event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivery. Returning `Err` makes the delivery count as a
    /// failed dispatch attempt.
    async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError> {
        (**self).handle(delivery).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(EventDelivery) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventDelivery) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError> {
        (self.0)(delivery.clone()).await
    }
}

/// NATS-style topic pattern: `.`-separated segments, `*` matches one
/// segment, `>` matches the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    tokens: Vec<PatternToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    AnyOne,
    Tail,
}

impl TopicPattern {
    /// Parse a pattern, rejecting empty segments and a non-final `>`.
    pub fn parse(pattern: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::Invalid {
            setting: "subscription.pattern",
            reason,
        };
        if pattern.is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }
        let segments: Vec<&str> = pattern.split('.').collect();
        let mut tokens = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            let token = match *segment {
                "" => return Err(invalid(format!("empty segment in `{pattern}`"))),
                "*" => PatternToken::AnyOne,
                ">" => {
                    if i != segments.len() - 1 {
                        return Err(invalid(format!("`>` must be the last segment in `{pattern}`")));
                    }
                    PatternToken::Tail
                }
                literal => PatternToken::Literal(literal.to_string()),
            };
            tokens.push(token);
        }
        Ok(Self { tokens })
    }

    /// Whether `topic` matches this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let mut segments = topic.split('.');
        for token in &self.tokens {
            match token {
                PatternToken::Tail => return segments.next().is_some(),
                PatternToken::AnyOne => {
                    if segments.next().is_none() {
                        return false;
                    }
                }
                PatternToken::Literal(expected) => match segments.next() {
                    Some(segment) if segment == expected => {}
                    _ => return false,
                },
            }
        }
        segments.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .tokens
            .iter()
            .map(|t| match t {
                PatternToken::Literal(s) => s.clone(),
                PatternToken::AnyOne => "*".to_string(),
                PatternToken::Tail => ">".to_string(),
            })
            .collect();
        write!(f, "{}", parts.join("."))
    }
}

struct Subscription {
    pattern: TopicPattern,
    handler: Arc<dyn EventHandler>,
}

/// Process-wide map from topic pattern to handlers.
///
/// Matching handlers are invoked in registration order; the first failure
/// fails the delivery (and a redelivery re-invokes every matching handler,
/// which is why handlers must be idempotent).
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every topic matching `pattern`
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConfigurationError> {
        let pattern = TopicPattern::parse(pattern)?;
        debug!(%pattern, "subscription registered");
        self.subscriptions
            .write()
            .expect("subscription registry poisoned")
            .push(Subscription { pattern, handler });
        Ok(())
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .expect("subscription registry poisoned")
            .len()
    }

    /// Whether no subscription has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every matching handler; returns how many matched.
    ///
    /// The matching set is copied out before any handler runs, so no lock is
    /// held across an await.
    pub async fn dispatch(&self, delivery: &EventDelivery) -> Result<usize, HandlerError> {
        let matching: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self
                .subscriptions
                .read()
                .expect("subscription registry poisoned");
            subscriptions
                .iter()
                .filter(|s| s.pattern.matches(&delivery.topic))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in &matching {
            handler.handle(delivery).await?;
        }
        Ok(matching.len())
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/// Wrapper that suppresses duplicate deliveries by record id.
///
/// Keeps a bounded window of recently processed ids; a delivery whose id is
/// in the window is acknowledged without re-running the inner handler. Ids
/// are recorded only after the inner handler succeeds, so failed attempts
/// are retried normally.
pub struct IdempotentHandler<H> {
    inner: H,
    seen: tokio::sync::Mutex<LruCache<Uuid, ()>>,
}

impl<H: EventHandler> IdempotentHandler<H> {
    /// Wrap `inner`, remembering up to `window` processed record ids
    pub fn new(inner: H, window: usize) -> Self {
        let capacity = NonZeroUsize::new(window.max(1)).expect("window >= 1");
        Self {
            inner,
            seen: tokio::sync::Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for IdempotentHandler<H> {
    async fn handle(&self, delivery: &EventDelivery) -> Result<(), HandlerError> {
        if self.seen.lock().await.contains(&delivery.record_id) {
            debug!(record_id = %delivery.record_id, "duplicate delivery suppressed");
            return Ok(());
        }
        self.inner.handle(delivery).await?;
        self.seen.lock().await.put(delivery.record_id, ());
        Ok(())
    }
}
