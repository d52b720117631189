//! In-memory broker implementation.
//!
//! A fully functional broker suitable for development and testing:
//! - Priority-ordered dequeue (highest priority first, FIFO within priority)
//! - Per-message delay for deferred availability
//! - Per-message and per-queue TTL with dead-letter forwarding
//! - In-flight tracking with visibility timeouts
//!
//! Expiry and lock bookkeeping are amortized into every locked operation, so
//! a retry queue configured with a dead-letter target drains back into its
//! target as soon as any broker operation observes the expiry.

use crate::client::BrokerClient;
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::topology::{BrokerConfig, QueueSpec};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in a queue with broker metadata
#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    priority: u8,
    seq: u64,
    enqueued_at: Timestamp,
    delivery_count: u32,
    available_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    forward_ttl: Option<Duration>,
}

impl StoredMessage {
    fn is_available(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A message currently locked by a consumer
#[derive(Debug)]
struct InFlightMessage {
    message: StoredMessage,
    lock_expires_at: DateTime<Utc>,
}

/// State for a single queue
#[derive(Debug)]
struct InMemoryQueue {
    spec: QueueSpec,
    messages: Vec<StoredMessage>,
    in_flight: HashMap<String, InFlightMessage>,
    next_seq: u64,
}

impl InMemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            messages: Vec::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, mut message: StoredMessage) {
        message.seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(message);
    }

    /// Index of the best available message: highest priority, then FIFO
    fn best_available(&self, now: DateTime<Utc>) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_available(now))
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(idx, _)| idx)
    }
}

/// Storage shared by all clones of the broker
#[derive(Debug)]
struct BrokerStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
}

impl BrokerStorage {
    fn queue_mut(&mut self, name: &QueueName) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: name.to_string(),
            })
    }

    /// Release expired in-flight locks and forward expired messages.
    ///
    /// Runs under the storage write lock; cost is proportional to the number
    /// of stored messages, which keeps the amortized overhead bounded.
    fn sweep(&mut self, now: DateTime<Utc>) {
        // Release expired locks back onto their queues
        for queue in self.queues.values_mut() {
            let expired: Vec<String> = queue
                .in_flight
                .iter()
                .filter(|(_, f)| now >= f.lock_expires_at)
                .map(|(handle, _)| handle.clone())
                .collect();

            for handle in expired {
                if let Some(in_flight) = queue.in_flight.remove(&handle) {
                    let mut message = in_flight.message;
                    message.available_at = now;
                    queue.messages.push(message);
                }
            }
        }

        // Collect expired messages per queue, then route to dead-letter targets
        let mut forwarded: Vec<(QueueName, StoredMessage)> = Vec::new();
        for queue in self.queues.values_mut() {
            let mut kept = Vec::with_capacity(queue.messages.len());
            for message in queue.messages.drain(..) {
                if message.is_expired(now) {
                    if let Some(target) = &queue.spec.dead_letter_target {
                        forwarded.push((target.clone(), message));
                    }
                    // No target: the message is dropped
                } else {
                    kept.push(message);
                }
            }
            queue.messages = kept;
        }

        for (target, mut message) in forwarded {
            if let Some(queue) = self.queues.get_mut(&target) {
                debug!(
                    message_id = %message.message_id,
                    target = %target,
                    "forwarding expired message to dead-letter target"
                );
                message.available_at = now;
                // The forward TTL applies once; a second forward falls back
                // to the next target's queue-level TTL
                let ttl = message.forward_ttl.take().or(queue.spec.queue_ttl);
                message.expires_at = ttl.map(|ttl| now + ttl);
                queue.push(message);
            }
        }
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementation
pub struct InMemoryBroker {
    storage: Arc<RwLock<BrokerStorage>>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl InMemoryBroker {
    /// Create a broker with the given queue topology and the system clock
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a broker driven by an explicit clock
    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        let queues = config
            .queues
            .into_iter()
            .map(|spec| (spec.name.clone(), InMemoryQueue::new(spec)))
            .collect();

        Self {
            storage: Arc::new(RwLock::new(BrokerStorage { queues })),
            clock,
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Try to receive one message without waiting
    fn try_receive(&self, queue: &QueueName) -> Result<Option<ReceivedMessage>, QueueError> {
        let now = self.clock.now();
        let mut storage = self.storage.write().expect("broker storage lock poisoned");
        storage.sweep(now);

        let visibility_timeout = self.visibility_timeout;
        let queue_state = storage.queue_mut(queue)?;

        let Some(idx) = queue_state.best_available(now) else {
            return Ok(None);
        };

        let mut message = queue_state.messages.swap_remove(idx);
        message.delivery_count += 1;

        let handle = uuid::Uuid::new_v4().to_string();
        let lock_expires_at = now + visibility_timeout;
        let receipt = ReceiptHandle::new(
            handle.clone(),
            queue.clone(),
            Timestamp::from_datetime(lock_expires_at),
        );

        let received = ReceivedMessage {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            attributes: message.attributes.clone(),
            priority: message.priority,
            receipt_handle: receipt,
            delivery_count: message.delivery_count,
            enqueued_at: message.enqueued_at,
            delivered_at: Timestamp::from_datetime(now),
        };

        queue_state.in_flight.insert(
            handle,
            InFlightMessage {
                message,
                lock_expires_at,
            },
        );

        Ok(Some(received))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
    ) -> Result<MessageId, QueueError> {
        let now = self.clock.now();
        let mut storage = self.storage.write().expect("broker storage lock poisoned");
        storage.sweep(now);

        let queue_state = storage.queue_mut(queue)?;

        let priority = match queue_state.spec.max_priority {
            Some(max) => message.priority.min(max),
            None => message.priority,
        };

        let ttl = message.time_to_live.or(queue_state.spec.queue_ttl);
        let available_at = now + message.delay.unwrap_or_else(Duration::zero);
        let message_id = MessageId::new();

        queue_state.push(StoredMessage {
            message_id: message_id.clone(),
            body: message.body,
            attributes: message.attributes,
            priority,
            seq: 0, // assigned by push
            enqueued_at: Timestamp::from_datetime(now),
            delivery_count: 0,
            available_at,
            expires_at: ttl.map(|ttl| now + ttl),
            forward_ttl: message.forward_time_to_live,
        });

        Ok(message_id)
    }

    async fn receive_message(
        &self,
        queue: &QueueName,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let deadline = self.clock.now() + timeout;

        loop {
            if let Some(received) = self.try_receive(queue)? {
                return Ok(Some(received));
            }

            if self.clock.now() >= deadline {
                return Ok(None);
            }

            let poll = self
                .poll_interval
                .to_std()
                .unwrap_or(std::time::Duration::from_millis(50));
            tokio::time::sleep(poll).await;
        }
    }

    async fn complete_message(&self, receipt: ReceiptHandle) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut storage = self.storage.write().expect("broker storage lock poisoned");
        storage.sweep(now);

        let queue_state = storage.queue_mut(receipt.queue())?;
        queue_state
            .in_flight
            .remove(receipt.handle())
            .map(|_| ())
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            })
    }

    async fn abandon_message(&self, receipt: ReceiptHandle) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut storage = self.storage.write().expect("broker storage lock poisoned");
        storage.sweep(now);

        let queue_state = storage.queue_mut(receipt.queue())?;
        let in_flight = queue_state
            .in_flight
            .remove(receipt.handle())
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            })?;

        let mut message = in_flight.message;
        message.available_at = now;
        queue_state.messages.push(message);

        Ok(())
    }

    async fn queue_depth(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let mut storage = self.storage.write().expect("broker storage lock poisoned");
        storage.sweep(now);

        Ok(storage.queue_mut(queue)?.messages.len())
    }
}
