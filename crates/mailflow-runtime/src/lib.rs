//! # Mailflow Runtime
//!
//! Provider-agnostic broker runtime for reliable message delivery.
//!
//! This library provides:
//! - Queue and message types with validated identifiers
//! - A [`BrokerClient`] trait abstracting the underlying broker
//! - Priority-aware dequeue with per-message delay and TTL
//! - Dead-letter forwarding between queues on message expiry
//! - A fully functional in-memory broker for development and testing
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`message`] - Message structures and receipt handles
//! - [`topology`] - Queue specifications and broker configuration
//! - [`client`] - The broker client trait
//! - [`providers`] - Broker implementations

pub mod client;
pub mod clock;
pub mod error;
pub mod message;
pub mod providers;
pub mod topology;

// Re-export commonly used types at crate root for convenience
pub use client::BrokerClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp};
pub use providers::InMemoryBroker;
pub use topology::{BrokerConfig, QueueSpec};
