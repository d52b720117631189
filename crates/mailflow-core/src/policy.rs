//! Priority levels and their delivery policies.
//!
//! Priority is resolved once at submission and travels with the message; the
//! worker and router consult the policy table rather than re-deriving it.

use crate::ValidationError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;

/// Delivery priority of a submitted email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// String form used in routing attributes and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ValidationError::Invalid {
                field: "priority".to_string(),
                message: format!(
                    "unknown priority '{other}', expected one of critical, high, normal, low"
                ),
            }),
        }
    }
}

/// Per-priority delivery parameters
///
/// `max_retries` bounds re-delivery after the first attempt, `message_ttl`
/// bounds how long the message may wait on the primary queue before it is
/// dead-lettered, and `broker_priority` drives dequeue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub message_ttl: Duration,
    pub broker_priority: u8,
}

impl DeliveryPolicy {
    /// Resolve the policy for a priority level
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => Self {
                max_retries: 5,
                message_ttl: Duration::seconds(60),
                broker_priority: 10,
            },
            Priority::High => Self {
                max_retries: 3,
                message_ttl: Duration::seconds(300),
                broker_priority: 7,
            },
            Priority::Normal => Self {
                max_retries: 2,
                message_ttl: Duration::seconds(300),
                broker_priority: 5,
            },
            Priority::Low => Self {
                max_retries: 1,
                message_ttl: Duration::seconds(3600),
                broker_priority: 2,
            },
        }
    }
}
