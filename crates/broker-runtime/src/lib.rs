//! # Broker Runtime
//!
//! Reliable producer/consumer runtime for message brokers, with automatic
//! connection recovery and cooperative cancellation.
//!
//! This library provides:
//! - A connection manager that reconnects under a constant-backoff policy and
//!   raises a one-shot failure signal when recovery is exhausted
//! - Queue provisioning for exclusive, self-cleaning subscription queues
//! - A paced, counter-driven producer loop
//! - A receive, acknowledge, report consumer loop
//! - An AMQP 1.0 transport and an in-memory broker with fault injection
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`endpoint`] - Broker address and credentials
//! - [`message`] - Messages, routing names and delivery handles
//! - [`recovery`] - Reconnection policy
//! - [`connection`] - Connection manager, producer and consumer handles
//! - [`topology`] - Address and queue declaration
//! - [`producer`] / [`consumer`] - The delivery loops
//! - [`transport`] - Traits implemented by broker backends
//! - [`providers`] - AMQP and in-memory backends

// Module declarations
pub mod connection;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod observer;
pub mod producer;
pub mod providers;
pub mod recovery;
pub mod topology;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use connection::{
    Connection, ConnectionFactory, ConnectionState, Consumer, Producer, RecoveryFailure,
};
pub use consumer::{subscribe, ConsumerLoop, ConsumerLoopState, ConsumerSummary};
pub use endpoint::{Credentials, Endpoint, DEFAULT_AMQP_PORT};
pub use error::{BrokerError, ConfigurationError, DecodeError, ValidationError};
pub use message::{
    AddressName, DeliveryHandle, DeliveryTag, Message, MessageId, QueueName, ReceivedMessage,
    Timestamp,
};
pub use observer::{LoopObserver, TracingObserver};
pub use producer::{ProducerLoop, ProducerSummary};
#[cfg(feature = "amqp")]
pub use providers::AmqpConnector;
pub use providers::{
    BrokerEvent, BrokerOperation, BrokerStats, InMemoryBroker, DEFAULT_JOURNAL_CAPACITY,
};
pub use recovery::RecoveryPolicy;
pub use topology::{declare_queue, QueueConfiguration, RoutingType, TopologyManager};
pub use transport::{BrokerConnector, BrokerSession, ConsumerLink, ProducerLink};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
