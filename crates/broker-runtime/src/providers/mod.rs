//! Broker transport implementations.
//!
//! This module contains concrete implementations of the transport traits in
//! [`crate::transport`] for different backends.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{
    BrokerEvent, BrokerOperation, BrokerStats, InMemoryBroker, DEFAULT_JOURNAL_CAPACITY,
};
