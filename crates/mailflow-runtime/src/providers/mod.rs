//! Broker implementations.

mod memory;

pub use memory::InMemoryBroker;
