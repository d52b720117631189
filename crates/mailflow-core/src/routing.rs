//! Queue topology and message publication.
//!
//! Three queues carry the pipeline:
//!
//! - the primary queue, priority-ordered, where workers consume
//! - the retry queue, which holds no consumers: messages are published with
//!   their backoff delay as TTL and dead-letter back into the primary queue
//!   when it elapses
//! - the dead-letter queue, terminal storage for exhausted and malformed
//!   messages
//!
//! A failed publish to the primary queue surfaces to the submitter. Failed
//! retry and dead-letter publishes are logged as lost and surfaced to the
//! worker, which still acknowledges the original delivery.

use crate::message::EmailMessage;
use crate::policy::DeliveryPolicy;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use mailflow_runtime::{
    BrokerClient, BrokerConfig, Message, MessageId, QueueError, QueueName, QueueSpec,
    SerializationError,
};
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;

/// Routing attribute: originating event ID
pub const ATTR_EVENT_ID: &str = "event_id";
/// Routing attribute: business event type
pub const ATTR_EVENT_TYPE: &str = "event_type";
/// Routing attribute: delivery priority level
pub const ATTR_PRIORITY: &str = "priority";
/// Routing attribute: retry count at publish time
pub const ATTR_RETRY_COUNT: &str = "retry_count";
/// Routing attribute on dead-lettered messages: terminal failure reason
pub const ATTR_FAILURE_REASON: &str = "failure_reason";

/// Highest broker priority any policy assigns
const MAX_BROKER_PRIORITY: u8 = 10;

/// Names of the three pipeline queues
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub primary: QueueName,
    pub retry: QueueName,
    pub dead_letter: QueueName,
}

impl QueueTopology {
    /// The standard topology used by the service
    pub fn standard() -> Self {
        Self {
            primary: QueueName::new("email.notifications").expect("hard-coded queue name"),
            retry: QueueName::new("email.retry").expect("hard-coded queue name"),
            dead_letter: QueueName::new("email.dlq").expect("hard-coded queue name"),
        }
    }

    /// Broker configuration declaring the three queues and their wiring
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::with_queues(vec![
            QueueSpec::new(self.primary.clone())
                .with_max_priority(MAX_BROKER_PRIORITY)
                .with_dead_letter_target(self.dead_letter.clone()),
            QueueSpec::new(self.retry.clone()).with_dead_letter_target(self.primary.clone()),
            QueueSpec::new(self.dead_letter.clone()),
        ])
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self::standard()
    }
}

/// Publishes pipeline messages to the right queue with the right envelope
pub struct QueueRouter {
    broker: Arc<dyn BrokerClient>,
    topology: QueueTopology,
}

impl QueueRouter {
    pub fn new(broker: Arc<dyn BrokerClient>, topology: QueueTopology) -> Self {
        Self { broker, topology }
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    fn encode(message: &EmailMessage) -> Result<Message, QueueError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| QueueError::from(SerializationError::JsonError(e)))?;

        Ok(Message::new(Bytes::from(body))
            .with_attribute(ATTR_EVENT_ID, message.event_id.as_str())
            .with_attribute(ATTR_EVENT_TYPE, &message.event_type)
            .with_attribute(ATTR_PRIORITY, message.priority.as_str())
            .with_attribute(ATTR_RETRY_COUNT, message.retry_count.to_string()))
    }

    /// Publish a freshly rendered message to the primary queue
    ///
    /// TTL and broker priority come from the message's delivery policy.
    /// Failures surface to the submitter.
    pub async fn publish_primary(&self, message: &EmailMessage) -> Result<MessageId, QueueError> {
        let policy = DeliveryPolicy::for_priority(message.priority);
        let envelope = Self::encode(message)?
            .with_priority(policy.broker_priority)
            .with_ttl(policy.message_ttl);

        let message_id = self.broker.send_message(&self.topology.primary, envelope).await?;

        debug!(
            event_id = %message.event_id,
            priority = %message.priority,
            queue = %self.topology.primary,
            "published message to primary queue"
        );

        Ok(message_id)
    }

    /// Publish a message to the retry queue with the given delay
    ///
    /// The delay is the envelope TTL; expiry dead-letters the message back
    /// into the primary queue. Broker priority is preserved so a re-entering
    /// message keeps its place in line, and the forward TTL restores the
    /// policy TTL it would have received on first publish.
    pub async fn publish_retry(
        &self,
        message: &EmailMessage,
        delay: Duration,
    ) -> Result<MessageId, QueueError> {
        let policy = DeliveryPolicy::for_priority(message.priority);
        let envelope = Self::encode(message)?
            .with_priority(policy.broker_priority)
            .with_ttl(delay)
            .with_forward_ttl(policy.message_ttl);

        let result = self.broker.send_message(&self.topology.retry, envelope).await;

        match &result {
            Ok(_) => {
                debug!(
                    event_id = %message.event_id,
                    retry_count = message.retry_count,
                    delay_ms = delay.num_milliseconds(),
                    "scheduled message for retry"
                );
            }
            Err(e) => {
                error!(
                    event_id = %message.event_id,
                    error = %e,
                    "retry publish failed, message is lost"
                );
            }
        }

        result
    }

    /// Move a message to the dead-letter queue with its terminal failure
    pub async fn publish_dead_letter(
        &self,
        message: &mut EmailMessage,
        reason: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<MessageId, QueueError> {
        message.mark_failed(reason, failed_at);

        let envelope = match Self::encode(message) {
            Ok(envelope) => envelope.with_attribute(ATTR_FAILURE_REASON, reason),
            Err(e) => {
                error!(event_id = %message.event_id, error = %e, "dead-letter encode failed");
                return Err(e);
            }
        };

        let result = self
            .broker
            .send_message(&self.topology.dead_letter, envelope)
            .await;

        if let Err(e) = &result {
            error!(
                event_id = %message.event_id,
                error = %e,
                "dead-letter publish failed, message is lost"
            );
        }

        result
    }

    /// Dead-letter a payload that could not be decoded
    ///
    /// The raw body is preserved as-is for inspection.
    pub async fn publish_dead_letter_raw(
        &self,
        body: Bytes,
        reason: &str,
    ) -> Result<MessageId, QueueError> {
        let envelope = Message::new(body).with_attribute(ATTR_FAILURE_REASON, reason);

        let result = self
            .broker
            .send_message(&self.topology.dead_letter, envelope)
            .await;

        if let Err(e) = &result {
            error!(error = %e, "dead-letter publish of malformed payload failed");
        }

        result
    }
}
