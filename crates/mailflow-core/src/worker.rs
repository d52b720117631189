//! The delivery worker state machine and pool.
//!
//! Each poll cycle dequeues one message from the primary queue, decides a
//! [`WorkerDecision`] locally, carries it out through the router, and
//! acknowledges the dequeued delivery exactly once. Failure handling:
//!
//! - transient transport error: increment `retry_count`; exhausted budgets
//!   dead-letter, otherwise schedule a retry with exponential backoff
//! - permanent transport error: increment and dead-letter immediately
//! - malformed payload: dead-letter the raw body without touching any budget
//! - not yet due (`scheduled_for` in the future): park on the retry queue
//!   for the remaining wait, budget untouched

use crate::message::EmailMessage;
use crate::metrics::PipelineMetrics;
use crate::routing::QueueRouter;
use crate::transport::Transport;
use chrono::Duration;
use mailflow_runtime::{BrokerClient, Clock, QueueError, ReceivedMessage, SystemClock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Backoff ceiling
const MAX_BACKOFF_MS: i64 = 60_000;

/// Default blocking-receive timeout for a poll cycle
const DEFAULT_RECEIVE_TIMEOUT_SECS: i64 = 5;

/// Exponential backoff before the next delivery cycle
///
/// `min(60s, 2^retry_count seconds)`, computed from the already-incremented
/// retry count.
pub fn backoff_delay(retry_count: u32) -> Duration {
    // 2^6 seconds already exceeds the ceiling; clamp before shifting
    if retry_count >= 6 {
        return Duration::milliseconds(MAX_BACKOFF_MS);
    }
    Duration::milliseconds(((1i64 << retry_count) * 1000).min(MAX_BACKOFF_MS))
}

/// What to do with a dequeued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerDecision {
    /// Delivered; acknowledge and move on
    AckSuccess,
    /// Re-deliver after the given delay
    RetryWithDelay(Duration),
    /// Terminal failure; isolate with the given reason
    DeadLetter(String),
}

/// A single delivery worker
pub struct DeliveryWorker {
    broker: Arc<dyn BrokerClient>,
    router: Arc<QueueRouter>,
    transport: Arc<dyn Transport>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    receive_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        router: Arc<QueueRouter>,
        transport: Arc<dyn Transport>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self::with_clock(
            broker,
            router,
            transport,
            metrics,
            Arc::new(SystemClock),
            Duration::seconds(DEFAULT_RECEIVE_TIMEOUT_SECS),
        )
    }

    /// Worker on an explicit clock and receive timeout, for tests
    pub fn with_clock(
        broker: Arc<dyn BrokerClient>,
        router: Arc<QueueRouter>,
        transport: Arc<dyn Transport>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            router,
            transport,
            metrics,
            clock,
            receive_timeout,
        }
    }

    /// Run one poll cycle; `Ok(true)` when a message was processed
    pub async fn poll_once(&self) -> Result<bool, QueueError> {
        let Some(received) = self
            .broker
            .receive_message(&self.router.topology().primary, self.receive_timeout)
            .await?
        else {
            return Ok(false);
        };

        self.handle(received).await;
        Ok(true)
    }

    async fn handle(&self, received: ReceivedMessage) {
        match serde_json::from_slice::<EmailMessage>(&received.body) {
            Ok(mut message) => {
                let decision = self.attempt(&mut message).await;
                self.settle(&mut message, decision).await;
            }
            Err(e) => {
                warn!(
                    message_id = %received.message_id,
                    error = %e,
                    "malformed payload on primary queue, dead-lettering raw body"
                );
                let _ = self
                    .router
                    .publish_dead_letter_raw(
                        received.body.clone(),
                        &format!("malformed payload: {e}"),
                    )
                    .await;
                // No decoded event type to label with
                self.metrics
                    .emails_failed
                    .with_label_values(&["unknown", "malformed"])
                    .inc();
                self.metrics.emails_dead_lettered.inc();
            }
        }

        // Exactly one acknowledgement per dequeue, after the decision has
        // been carried out
        if let Err(e) = self.broker.complete_message(received.receipt_handle).await {
            warn!(
                message_id = %received.message_id,
                error = %e,
                "failed to acknowledge delivery"
            );
        }
    }

    /// Decide the fate of one dequeued message
    async fn attempt(&self, message: &mut EmailMessage) -> WorkerDecision {
        let now = self.clock.now();
        if let Some(scheduled_for) = message.scheduled_for {
            if scheduled_for > now {
                return WorkerDecision::RetryWithDelay(scheduled_for - now);
            }
        }

        message.attempt_count += 1;

        let timer = self
            .metrics
            .send_duration
            .with_label_values(&[self.transport.provider_name()])
            .start_timer();
        let result = self.transport.send(message).await;
        timer.observe_duration();

        match result {
            Ok(outcome) => {
                info!(
                    event_id = %message.event_id,
                    provider = %outcome.provider,
                    provider_message_id = ?outcome.provider_message_id,
                    attempts = message.attempt_count,
                    "email delivered"
                );
                self.metrics
                    .emails_sent
                    .with_label_values(&[&outcome.provider, &message.event_type])
                    .inc();
                WorkerDecision::AckSuccess
            }
            Err(e) if e.is_retryable() => {
                message.retry_count += 1;
                self.metrics
                    .emails_failed
                    .with_label_values(&[&message.event_type, "transient"])
                    .inc();

                if message.is_exhausted() {
                    warn!(
                        event_id = %message.event_id,
                        retry_count = message.retry_count,
                        max_retries = message.max_retries,
                        error = %e,
                        "retry budget exhausted"
                    );
                    WorkerDecision::DeadLetter(format!("retries exhausted: {e}"))
                } else {
                    self.metrics
                        .emails_retried
                        .with_label_values(&[&message.event_type])
                        .inc();
                    WorkerDecision::RetryWithDelay(backoff_delay(message.retry_count))
                }
            }
            Err(e) => {
                message.retry_count += 1;
                warn!(
                    event_id = %message.event_id,
                    error = %e,
                    "permanent delivery failure"
                );
                self.metrics
                    .emails_failed
                    .with_label_values(&[&message.event_type, "permanent"])
                    .inc();
                WorkerDecision::DeadLetter(e.to_string())
            }
        }
    }

    async fn settle(&self, message: &mut EmailMessage, decision: WorkerDecision) {
        match decision {
            WorkerDecision::AckSuccess => {}
            WorkerDecision::RetryWithDelay(delay) => {
                // Router logs a failed publish as lost
                let _ = self.router.publish_retry(message, delay).await;
            }
            WorkerDecision::DeadLetter(reason) => {
                let _ = self
                    .router
                    .publish_dead_letter(message, &reason, self.clock.now())
                    .await;
                self.metrics.emails_dead_lettered.inc();
            }
        }
    }

    /// Poll until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("delivery worker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        error!(error = %e, "worker poll failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }

        info!("delivery worker stopped");
    }
}

/// A fixed-size pool of delivery workers sharing one broker connection
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers that stop when `shutdown` fires
    pub fn spawn(
        worker: Arc<DeliveryWorker>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..concurrency)
            .map(|index| {
                let worker = worker.clone();
                let shutdown = shutdown.clone();
                let span = tracing::info_span!("delivery_worker", worker = index);
                tokio::spawn(async move { worker.run(shutdown).await }.instrument(span))
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to finish
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}
