//! Pluggable delivery providers.
//!
//! The worker holds exactly one [`Transport`], selected at startup from
//! configuration. Transport errors carry a `retryable` flag; the worker's
//! retry decision depends only on that flag, never on provider specifics.

use crate::message::{DeliveryOutcome, EmailMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// A failed delivery attempt
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} delivery failed: {message}")]
pub struct TransportError {
    pub provider: String,
    pub error_code: Option<u16>,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    /// A failure worth retrying: network trouble, timeouts, 5xx responses
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            error_code: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Classify an HTTP status from a provider API
    ///
    /// Client errors that indicate a bad request or bad credentials will
    /// fail identically on every retry; everything else is retryable.
    pub fn from_status(provider: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let retryable = !matches!(status, 400 | 401 | 403 | 404);
        Self {
            provider: provider.into(),
            error_code: Some(status),
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// A delivery provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in metrics labels and delivery outcomes
    fn provider_name(&self) -> &str;

    /// Attempt delivery of one rendered message
    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, TransportError>;
}

// ============================================================================
// HTTP API Transport
// ============================================================================

const HTTP_PROVIDER: &str = "http-api";

#[derive(Debug, Serialize)]
struct SendPayload<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    subject: &'a str,
    html_body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_body: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Delivery through a provider's REST API
pub struct HttpApiTransport {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpApiTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_token,
        }
    }
}

#[async_trait]
impl Transport for HttpApiTransport {
    fn provider_name(&self) -> &str {
        HTTP_PROVIDER
    }

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, TransportError> {
        let started = Instant::now();
        let url = format!("{}/messages", self.base_url);

        let mut request = self.client.post(&url).json(&SendPayload {
            from: &message.from,
            to: &message.to,
            reply_to: message.reply_to.as_deref(),
            subject: &message.content.subject,
            html_body: &message.content.html_body,
            text_body: message.content.text_body.as_deref(),
        });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::transient(HTTP_PROVIDER, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(
                HTTP_PROVIDER,
                status.as_u16(),
                format!("provider rejected send: {body}"),
            ));
        }

        let parsed: SendResponse = response.json().await.unwrap_or(SendResponse {
            message_id: None,
        });

        Ok(DeliveryOutcome {
            provider: HTTP_PROVIDER.to_string(),
            provider_message_id: parsed.message_id,
            duration: started.elapsed(),
        })
    }
}

// ============================================================================
// Log Transport
// ============================================================================

/// Transport that logs instead of sending; for development and tests
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn provider_name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryOutcome, TransportError> {
        info!(
            event_id = %message.event_id,
            to = %message.to,
            subject = %message.content.subject,
            "delivering email to log transport"
        );

        Ok(DeliveryOutcome {
            provider: "log".to_string(),
            provider_message_id: Some(uuid::Uuid::new_v4().to_string()),
            duration: std::time::Duration::ZERO,
        })
    }
}
