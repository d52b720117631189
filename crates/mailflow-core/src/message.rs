//! Pipeline data model: requests, drafts, rendered messages, and receipts.
//!
//! A submission moves through three shapes:
//!
//! 1. [`EmailRequest`] — the caller-supplied DTO, everything optional that
//!    can be defaulted.
//! 2. [`EmailDraft`] — validated and enriched, but not yet rendered. Drafts
//!    never reach a queue.
//! 3. [`EmailMessage`] — rendered and immutable in content; the only shape
//!    that flows through the broker. Retry bookkeeping lives here.
//!
//! Keeping draft and rendered message as distinct types makes "has this been
//! rendered" a compile-time property instead of a runtime flag.

use crate::policy::{DeliveryPolicy, Priority};
use crate::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

/// Metadata key carrying the terminal failure reason on dead-lettered messages
pub const METADATA_FAILURE_REASON: &str = "failure_reason";

/// Metadata key carrying the dead-letter timestamp (RFC 3339)
pub const METADATA_FAILED_AT: &str = "failed_at";

// ============================================================================
// Submission DTO
// ============================================================================

/// A caller-facing email submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRequest {
    /// Idempotency key; generated when absent
    #[serde(default)]
    pub event_id: Option<String>,

    /// Business event that triggered the email, e.g. `appointment_reminder`
    pub event_type: String,

    pub recipient_email: String,

    #[serde(default)]
    pub recipient_name: Option<String>,

    #[serde(default)]
    pub template_id: Option<String>,

    #[serde(default)]
    pub template_data: Option<HashMap<String, serde_json::Value>>,

    /// One of `critical`, `high`, `normal`, `low`; defaults to `normal`
    #[serde(default)]
    pub priority: Option<String>,

    #[serde(default)]
    pub locale: Option<String>,

    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,

    /// Defer delivery until this instant
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

// ============================================================================
// Draft (pre-render)
// ============================================================================

/// A validated, enriched submission that has not been rendered yet
#[derive(Debug, Clone)]
pub struct EmailDraft {
    pub event_id: EventId,
    pub event_type: String,
    pub to: String,
    pub recipient_name: Option<String>,
    pub from: String,
    pub reply_to: Option<String>,
    pub template_id: Option<String>,
    pub template_data: HashMap<String, serde_json::Value>,
    pub priority: Priority,
    pub locale: String,
    pub metadata: HashMap<String, String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

// ============================================================================
// Rendered message
// ============================================================================

/// Rendered email content, immutable once produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
}

impl RenderedContent {
    /// Content for a draft without a template
    pub fn empty() -> Self {
        Self {
            subject: String::new(),
            html_body: String::new(),
            text_body: None,
        }
    }
}

/// The rendered email flowing through the queues
///
/// Invariant: `retry_count <= max_retries`. The worker increments
/// `retry_count` before comparing; once the two are equal the message is
/// dead-lettered and never re-enters the primary queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub event_id: EventId,
    pub event_type: String,
    pub to: String,
    #[serde(default)]
    pub recipient_name: Option<String>,
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub content: RenderedContent,
    #[serde(default)]
    pub template_id: Option<String>,
    pub locale: String,
    pub priority: Priority,
    #[serde(default)]
    pub template_data: HashMap<String, serde_json::Value>,
    /// Mutable annotations; dead-lettering records its reason here
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Failed delivery cycles so far
    pub retry_count: u32,
    /// Fixed at creation from the priority's delivery policy
    pub max_retries: u32,
    /// Transport attempts, including the first
    pub attempt_count: u32,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EmailMessage {
    /// Build the queue-ready message from a rendered draft
    pub fn from_draft(draft: EmailDraft, content: RenderedContent, now: DateTime<Utc>) -> Self {
        let policy = DeliveryPolicy::for_priority(draft.priority);
        Self {
            event_id: draft.event_id,
            event_type: draft.event_type,
            to: draft.to,
            recipient_name: draft.recipient_name,
            from: draft.from,
            reply_to: draft.reply_to,
            content,
            template_id: draft.template_id,
            locale: draft.locale,
            priority: draft.priority,
            template_data: draft.template_data,
            metadata: draft.metadata,
            retry_count: 0,
            max_retries: policy.max_retries,
            attempt_count: 0,
            scheduled_for: draft.scheduled_for,
            created_at: now,
        }
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Annotate the message with its terminal failure before dead-lettering
    pub fn mark_failed(&mut self, reason: &str, failed_at: DateTime<Utc>) {
        self.metadata
            .insert(METADATA_FAILURE_REASON.to_string(), reason.to_string());
        self.metadata
            .insert(METADATA_FAILED_AT.to_string(), failed_at.to_rfc3339());
    }
}

// ============================================================================
// Outcomes and receipts
// ============================================================================

/// Result of one successful transport attempt
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub duration: std::time::Duration,
}

/// Disposition of a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    /// Accepted and enqueued for delivery
    Queued,
    /// Suppressed: the event was already submitted within the dedup window
    Duplicate,
}

/// Synchronous acknowledgement returned to the submitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub message_id: EventId,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
}

/// Per-item result within a batch submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub recipient_email: String,
    #[serde(default)]
    pub receipt: Option<SubmissionReceipt>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate result of a batch submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<BatchItemResult>,
}
