//! Delivery-status bookkeeping against an external store.
//!
//! Status logging is best effort: the pipeline never fails a submission or a
//! delivery because the store was unreachable. Callers query the store to
//! answer "what happened to event X".

use crate::EventId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;

/// Lifecycle state of a submitted email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Queued,
    Sent,
    Failed,
    DeadLettered,
}

/// One status record for a submitted email
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub event_id: EventId,
    pub status: DeliveryState,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub provider_message_id: Option<String>,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl DeliveryStatus {
    /// Initial record written when a submission is queued
    pub fn queued(event_id: EventId, created_at: DateTime<Utc>) -> Self {
        Self {
            event_id,
            status: DeliveryState::Queued,
            provider: None,
            provider_message_id: None,
            attempts: 0,
            last_error: None,
            created_at,
            sent_at: None,
            failed_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status store request failed: {message}")]
    Unavailable { message: String },

    #[error("status store returned an invalid response: {message}")]
    InvalidResponse { message: String },
}

/// External store of delivery-status records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record a status transition; failures are the caller's to tolerate
    async fn log_submission(&self, record: &DeliveryStatus) -> Result<(), StatusError>;

    /// Look up the latest status for an event
    async fn get_status(&self, event_id: &EventId) -> Result<Option<DeliveryStatus>, StatusError>;
}

#[derive(Debug, Serialize)]
struct StatusQuery<'a> {
    event_id: &'a str,
}

/// Status store backed by a REST service
pub struct HttpStatusStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StatusStore for HttpStatusStore {
    async fn log_submission(&self, record: &DeliveryStatus) -> Result<(), StatusError> {
        let url = format!("{}/log-email-request", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(|e| StatusError::Unavailable {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(StatusError::Unavailable {
                message: format!("store responded with status {}", response.status()),
            });
        }

        Ok(())
    }

    async fn get_status(&self, event_id: &EventId) -> Result<Option<DeliveryStatus>, StatusError> {
        let url = format!("{}/get-email-status", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&StatusQuery {
                event_id: event_id.as_str(),
            })
            .send()
            .await
            .map_err(|e| StatusError::Unavailable {
                message: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(StatusError::Unavailable {
                message: format!("store responded with status {}", response.status()),
            });
        }

        let mut records: Vec<DeliveryStatus> =
            response
                .json()
                .await
                .map_err(|e| StatusError::InvalidResponse {
                    message: e.to_string(),
                })?;

        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }
}
