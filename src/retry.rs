//! Bounded exponential backoff with jitter.
//!
//! Storage adapters retry transient I/O failures locally (invisible to
//! callers when they eventually succeed); the dispatcher uses the same
//! policy to schedule redelivery of failed outbox records.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification hook: only transient failures are worth retrying.
pub trait Transient {
    /// Whether retrying this error could plausibly succeed
    fn is_transient(&self) -> bool;
}

/// Retry policy: exponential growth from a base delay up to a ceiling,
/// with proportional jitter to avoid thundering herds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt cap, including the first attempt
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Ceiling for the exponential growth
    pub max_delay: Duration,
    /// Jitter as a fraction of the computed delay, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt cap and base delay, default ceiling and
    /// jitter
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// Grows as `base * 2^(attempt-1)`, capped at `max_delay`, then spread by
    /// up to `jitter` in either direction.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if self.jitter <= 0.0 || raw.is_zero() {
            return raw;
        }
        let spread = raw.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((raw.as_secs_f64() + offset).max(0.0))
    }
}

/// Run `op` under the policy, retrying transient failures.
///
/// Non-transient errors and retry exhaustion propagate to the caller
/// unchanged; nothing is ever silently dropped.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(%err, attempt, delay_ms = delay.as_millis() as u64, "{what}: transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(%err, attempt, "{what}: retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
