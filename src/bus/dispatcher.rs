//! Dispatch workers: the state machine that drains the outbox.
//!
//! Each worker loops: recover expired claims, claim due records (one per
//! topic, oldest first), publish each under a deadline, and report the
//! outcome — `Dispatched` on acknowledgment, a backoff-scheduled retry on
//! failure, `DeadLettered` once the attempt cap is spent. Workers hold no
//! locks across I/O; the claim token is the only coordination.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::subscriptions::EventDelivery;
use super::transport::EventTransport;
use crate::outbox::{ClaimedEvent, FailureOutcome, OutboxError, OutboxStore};
use crate::retry::RetryPolicy;
use crate::settings::DispatchSettings;

struct DispatchContext {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn EventTransport>,
    settings: DispatchSettings,
    backoff: RetryPolicy,
}

/// The outbox dispatcher: a pool of cooperative polling workers.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Build a dispatcher; no workers run until [`start`](Self::start).
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn EventTransport>,
        settings: DispatchSettings,
    ) -> Self {
        let backoff = RetryPolicy {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            jitter: 0.2,
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(DispatchContext {
                store,
                transport,
                settings,
                backoff,
            }),
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Spawn the configured number of worker tasks.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        info!(workers = self.ctx.settings.workers, "outbox dispatcher starting");
        for i in 0..self.ctx.settings.workers {
            let ctx = self.ctx.clone();
            let mut shutdown = self.shutdown.subscribe();
            let worker = format!("dispatch-{i}");
            self.workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        result = Self::drain_once(&ctx, &worker) => {
                            let idle = match result {
                                Ok(0) => true,
                                Ok(_) => false,
                                Err(err) => {
                                    warn!(worker, %err, "outbox poll failed");
                                    true
                                }
                            };
                            if idle {
                                // Cooperative wait between polling cycles.
                                tokio::select! {
                                    _ = shutdown.changed() => break,
                                    _ = tokio::time::sleep(ctx.settings.poll_interval()) => {}
                                }
                            }
                        }
                    }
                }
                debug!(worker, "dispatch worker stopped");
            }));
        }
    }

    /// One full claim-and-dispatch cycle; returns how many records were
    /// processed. Also the deterministic entry point used by tests and
    /// cron-style deployments.
    pub async fn run_once(&self, worker: &str) -> Result<usize, OutboxError> {
        Self::drain_once(&self.ctx, worker).await
    }

    async fn drain_once(ctx: &DispatchContext, worker: &str) -> Result<usize, OutboxError> {
        let now = Utc::now();

        // Claims abandoned by a crashed or stopped worker come back first.
        let lease = ChronoDuration::milliseconds(ctx.settings.claim_lease_secs as i64 * 1000);
        let released = ctx.store.recover_expired_claims(now - lease).await?;
        if released > 0 {
            info!(worker, released, "recovered expired outbox claims");
        }

        let claims = ctx
            .store
            .claim_due(worker, now, ctx.settings.batch_size)
            .await?;
        let count = claims.len();
        for claim in claims {
            Self::dispatch_one(ctx, worker, claim).await?;
        }
        Ok(count)
    }

    async fn dispatch_one(
        ctx: &DispatchContext,
        worker: &str,
        claim: ClaimedEvent,
    ) -> Result<(), OutboxError> {
        let attempt = claim.record.attempts + 1;
        let delivery = EventDelivery {
            record_id: claim.record.id,
            topic: claim.record.topic.clone(),
            payload: claim.record.payload.clone(),
            attempt,
        };

        let outcome = tokio::time::timeout(
            ctx.settings.attempt_timeout(),
            ctx.transport.publish(&delivery),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                if ctx
                    .store
                    .mark_dispatched(claim.record.id, claim.token)
                    .await?
                {
                    debug!(worker, topic = %delivery.topic, attempt, "event dispatched");
                } else {
                    // Claim expired under us; whoever holds it now owns the
                    // outcome. Redelivery is possible and permitted.
                    debug!(worker, record = %claim.record.id, "claim lost before ack");
                }
            }
            publish_failure => {
                let reason = match publish_failure {
                    Ok(Err(err)) => err.to_string(),
                    _ => format!(
                        "publish timed out after {}ms",
                        ctx.settings.attempt_timeout_ms
                    ),
                };
                let dead = attempt >= ctx.settings.max_attempts;
                let retry_at = if dead {
                    None
                } else {
                    let delay = ctx.backoff.delay_for(attempt);
                    Some(Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64))
                };
                if dead {
                    error!(
                        worker,
                        record = %claim.record.id,
                        topic = %claim.record.topic,
                        attempt,
                        %reason,
                        "attempt cap exhausted; dead-lettering"
                    );
                } else {
                    warn!(
                        worker,
                        record = %claim.record.id,
                        topic = %claim.record.topic,
                        attempt,
                        %reason,
                        "dispatch failed; retry scheduled"
                    );
                }
                ctx.store
                    .mark_failed(
                        claim.record.id,
                        claim.token,
                        FailureOutcome {
                            error: reason,
                            retry_at,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Signal workers to stop and abandon in-flight attempts; records left
    /// claimed are reprocessed after the lease expires.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .finish()
    }
}
