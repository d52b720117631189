//! The submission service: intake for new email requests.
//!
//! One submission runs validate, dedup, enrich, render, publish, and a
//! best-effort status log, in that order. Admission into the idempotency
//! guard happens before the expensive stages; when render or publish fails
//! afterwards, the admission is compensated with `forget` so the caller can
//! resubmit the same event.
//!
//! A duplicate is a defined outcome with its own receipt status, never an
//! error.

use crate::idempotency::{Admission, IdempotencyGuard};
use crate::message::{
    BatchItemResult, BatchReceipt, EmailDraft, EmailRequest, SubmissionReceipt, SubmissionStatus,
};
use crate::policy::Priority;
use crate::routing::QueueRouter;
use crate::status::{DeliveryStatus, StatusError, StatusStore};
use crate::template::{TemplateError, TemplateRenderer};
use crate::{EventId, ValidationError};
use mailflow_runtime::{Clock, QueueError, SystemClock};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(test)]
#[path = "submission_tests.rs"]
mod tests;

/// Batch submissions fan out this many requests at a time
const BATCH_CHUNK_SIZE: usize = 10;

/// Sender fields applied to every draft
#[derive(Debug, Clone)]
pub struct SenderDefaults {
    pub from: String,
    pub reply_to: Option<String>,
    pub default_locale: String,
}

/// Why a submission was rejected
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("failed to enqueue message: {0}")]
    Queue(#[from] QueueError),
}

/// Front-of-pipeline service turning requests into queued messages
pub struct SubmissionService {
    guard: IdempotencyGuard,
    renderer: Arc<TemplateRenderer>,
    router: Arc<QueueRouter>,
    status: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    defaults: SenderDefaults,
}

impl SubmissionService {
    pub fn new(
        renderer: Arc<TemplateRenderer>,
        router: Arc<QueueRouter>,
        status: Arc<dyn StatusStore>,
        defaults: SenderDefaults,
    ) -> Self {
        Self::with_clock(renderer, router, status, defaults, Arc::new(SystemClock))
    }

    /// Service on an explicit clock, for tests
    pub fn with_clock(
        renderer: Arc<TemplateRenderer>,
        router: Arc<QueueRouter>,
        status: Arc<dyn StatusStore>,
        defaults: SenderDefaults,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::with_clock(clock.clone()),
            renderer,
            router,
            status,
            clock,
            defaults,
        }
    }

    /// Submit one email request
    pub async fn submit(&self, request: EmailRequest) -> Result<SubmissionReceipt, SubmissionError> {
        validate(&request)?;

        let priority = match &request.priority {
            Some(value) => value.parse::<Priority>()?,
            None => Priority::default(),
        };
        let event_id = match &request.event_id {
            Some(id) => EventId::new(id.clone())?,
            None => EventId::generate(),
        };

        if self.guard.check_and_record(&event_id) == Admission::Duplicate {
            info!(event_id = %event_id, "duplicate submission suppressed");
            return Ok(SubmissionReceipt {
                message_id: event_id,
                status: SubmissionStatus::Duplicate,
                queued_at: None,
            });
        }

        let draft = EmailDraft {
            event_id: event_id.clone(),
            event_type: request.event_type,
            to: request.recipient_email,
            recipient_name: request.recipient_name,
            from: self.defaults.from.clone(),
            reply_to: self.defaults.reply_to.clone(),
            template_id: request.template_id,
            template_data: request.template_data.unwrap_or_default(),
            priority,
            locale: request
                .locale
                .unwrap_or_else(|| self.defaults.default_locale.clone()),
            metadata: request.metadata.unwrap_or_default(),
            scheduled_for: request.scheduled_for,
        };

        let now = self.clock.now();
        let message = match self.renderer.render(draft, now).await {
            Ok(message) => message,
            Err(e) => {
                // Admission compensation: the event never reached a queue
                self.guard.forget(&event_id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.router.publish_primary(&message).await {
            self.guard.forget(&event_id);
            return Err(e.into());
        }

        let record = DeliveryStatus::queued(event_id.clone(), now);
        if let Err(e) = self.status.log_submission(&record).await {
            warn!(
                event_id = %event_id,
                error = %e,
                "status log failed, submission continues"
            );
        }

        info!(
            event_id = %event_id,
            priority = %message.priority,
            scheduled = message.scheduled_for.is_some(),
            "email submission queued"
        );

        Ok(SubmissionReceipt {
            message_id: event_id,
            status: SubmissionStatus::Queued,
            queued_at: Some(now),
        })
    }

    /// Submit a batch of requests with bounded fan-out
    ///
    /// One bad request never fails the batch; each item carries its own
    /// outcome.
    pub async fn submit_batch(&self, requests: Vec<EmailRequest>) -> BatchReceipt {
        let total = requests.len();
        let mut results = Vec::with_capacity(total);
        let mut accepted = 0;
        let mut rejected = 0;

        let mut remaining = requests.into_iter();
        loop {
            let chunk: Vec<EmailRequest> = remaining.by_ref().take(BATCH_CHUNK_SIZE).collect();
            if chunk.is_empty() {
                break;
            }

            let outcomes = futures::future::join_all(chunk.into_iter().map(|request| {
                let recipient_email = request.recipient_email.clone();
                async move { (recipient_email, self.submit(request).await) }
            }))
            .await;

            for (recipient_email, outcome) in outcomes {
                match outcome {
                    Ok(receipt) => {
                        accepted += 1;
                        results.push(BatchItemResult {
                            recipient_email,
                            receipt: Some(receipt),
                            error: None,
                        });
                    }
                    Err(e) => {
                        rejected += 1;
                        results.push(BatchItemResult {
                            recipient_email,
                            receipt: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }
        }

        BatchReceipt {
            total,
            accepted,
            rejected,
            results,
        }
    }

    /// Look up the delivery status of a previously submitted event
    pub async fn delivery_status(
        &self,
        event_id: &EventId,
    ) -> Result<Option<DeliveryStatus>, StatusError> {
        self.status.get_status(event_id).await
    }
}

fn validate(request: &EmailRequest) -> Result<(), ValidationError> {
    if request.event_type.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "event_type".to_string(),
        });
    }

    let email = request.recipient_email.trim();
    if email.is_empty() {
        return Err(ValidationError::Required {
            field: "recipient_email".to_string(),
        });
    }
    // Deliverability is the provider's concern; this only rejects obvious junk
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ValidationError::Invalid {
            field: "recipient_email".to_string(),
            message: "not a plausible email address".to_string(),
        });
    }

    Ok(())
}
