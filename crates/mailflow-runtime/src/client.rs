//! The broker client trait.

use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use async_trait::async_trait;
use chrono::Duration;

/// Main interface for broker operations
///
/// The broker guarantees each queued message is delivered to at most one
/// consumer at a time: a received message stays invisible until it is
/// completed, abandoned, or its visibility timeout lapses.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Send a message to a queue
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError>;

    /// Receive a single message, waiting up to `timeout` for one to arrive
    ///
    /// A zero (or negative) timeout polls once and returns immediately.
    async fn receive_message(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Mark a received message as processed, removing it permanently
    async fn complete_message(&self, receipt: ReceiptHandle) -> Result<(), QueueError>;

    /// Return a received message to its queue for redelivery
    async fn abandon_message(&self, receipt: ReceiptHandle) -> Result<(), QueueError>;

    /// Number of messages currently waiting in a queue (excluding in-flight)
    async fn queue_depth(&self, queue: &QueueName) -> Result<usize, QueueError>;
}
