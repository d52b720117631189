//! Queue specifications and broker configuration.

use crate::message::QueueName;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Declarative specification for a single queue
///
/// `queue_ttl` applies to messages that carry no per-message TTL.
/// When a message expires (per-message TTL first, queue TTL otherwise) it is
/// forwarded to `dead_letter_target`, or dropped if no target is configured.
/// This is the mechanism behind a delay queue: a short TTL plus a
/// dead-letter target pointing back at the primary queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: QueueName,

    /// Highest broker priority honored on this queue; higher values are clamped
    pub max_priority: Option<u8>,

    /// Default TTL for messages without a per-message TTL
    #[serde(default, with = "crate::message::opt_duration_ms")]
    pub queue_ttl: Option<Duration>,

    /// Where expired messages go; `None` drops them
    pub dead_letter_target: Option<QueueName>,
}

impl QueueSpec {
    /// Create a queue spec with no TTL and no dead-letter target
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            max_priority: None,
            queue_ttl: None,
            dead_letter_target: None,
        }
    }

    /// Set the maximum honored priority
    pub fn with_max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    /// Set the queue-level default TTL
    pub fn with_queue_ttl(mut self, ttl: Duration) -> Self {
        self.queue_ttl = Some(ttl);
        self
    }

    /// Forward expired messages to another queue
    pub fn with_dead_letter_target(mut self, target: QueueName) -> Self {
        self.dead_letter_target = Some(target);
        self
    }
}

/// Broker-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Declared queues; sending to an undeclared queue is an error
    pub queues: Vec<QueueSpec>,

    /// How long a received message stays locked before redelivery
    #[serde(with = "crate::message::duration_ms")]
    pub visibility_timeout: Duration,

    /// Poll interval used by blocking receives
    #[serde(with = "crate::message::duration_ms")]
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            visibility_timeout: Duration::seconds(30),
            poll_interval: Duration::milliseconds(50),
        }
    }
}

impl BrokerConfig {
    /// Create a broker config for the given queues with default timings
    pub fn with_queues(queues: Vec<QueueSpec>) -> Self {
        Self {
            queues,
            ..Self::default()
        }
    }
}
