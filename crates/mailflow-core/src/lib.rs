//! Core delivery-pipeline logic for the mailflow email notification service.
//!
//! This crate contains the domain model and pipeline stages that turn an
//! accepted [`EmailRequest`](message::EmailRequest) into a delivered email:
//!
//! - [`idempotency`] — duplicate suppression for submissions
//! - [`template`] — template fetch, cache, and rendering
//! - [`policy`] — priority levels and their delivery policies
//! - [`routing`] — queue topology and message publication
//! - [`worker`] — the delivery worker state machine and pool
//! - [`submission`] — the front-of-pipeline submission service
//! - [`transport`] — pluggable delivery providers
//! - [`status`] — external delivery-status bookkeeping
//! - [`metrics`] — prometheus instrumentation for the pipeline
//!
//! Broker primitives (queues, messages, receipts) live in `mailflow-runtime`;
//! everything here is broker-agnostic and talks to the runtime through the
//! `BrokerClient` trait.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod idempotency;
pub mod message;
pub mod metrics;
pub mod policy;
pub mod routing;
pub mod status;
pub mod submission;
pub mod template;
pub mod transport;
pub mod worker;

pub use idempotency::{Admission, IdempotencyGuard};
pub use message::{
    BatchItemResult, BatchReceipt, DeliveryOutcome, EmailDraft, EmailMessage, EmailRequest,
    RenderedContent, SubmissionReceipt, SubmissionStatus,
};
pub use metrics::PipelineMetrics;
pub use policy::{DeliveryPolicy, Priority};
pub use routing::{QueueRouter, QueueTopology};
pub use status::{DeliveryState, DeliveryStatus, HttpStatusStore, StatusError, StatusStore};
pub use submission::{SenderDefaults, SubmissionError, SubmissionService};
pub use template::{
    HttpTemplateStore, Template, TemplateError, TemplateRenderer, TemplateStore,
};
pub use transport::{HttpApiTransport, LogTransport, Transport, TransportError};
pub use worker::{DeliveryWorker, WorkerDecision, WorkerPool};

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a submitted email event
///
/// Callers may supply their own identifier for idempotent submission; when
/// absent, one is generated at intake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Create an event ID from a caller-supplied value
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "event_id".to_string(),
            });
        }
        if id.len() > 128 {
            return Err(ValidationError::Invalid {
                field: "event_id".to_string(),
                message: "must be at most 128 characters".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Generate a fresh random event ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get event ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validation failures for submitted requests
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("required field '{field}' is missing or empty")]
    Required { field: String },

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },
}
