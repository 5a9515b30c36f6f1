//! Transport traits implemented by broker backends.
//!
//! The connection manager and the delivery loops only depend on these traits;
//! wire-protocol details (framing, authentication, flow control) live in the
//! implementations under [`crate::providers`].
//!
//! Implementations report a dead transport as [`BrokerError::ConnectionLost`],
//! which starts connection recovery.

use crate::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::message::{AddressName, DeliveryTag, Message, QueueName, ReceivedMessage};
use crate::topology::{QueueConfiguration, RoutingType};
use async_trait::async_trait;

/// Opens sessions to a broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new session with the broker at `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BrokerSession>, BrokerError>;

    /// Short transport name used in logs
    fn transport_name(&self) -> &'static str;
}

/// A live session with the broker
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a queue (and its address when auto-create is requested)
    async fn declare_queue(&self, config: &QueueConfiguration) -> Result<(), BrokerError>;

    /// Attach a sending link to `address`
    async fn create_producer(
        &self,
        address: &AddressName,
        routing_type: RoutingType,
    ) -> Result<Box<dyn ProducerLink>, BrokerError>;

    /// Attach a receiving link to `queue` on `address`
    async fn create_consumer(
        &self,
        address: &AddressName,
        queue: &QueueName,
    ) -> Result<Box<dyn ConsumerLink>, BrokerError>;

    /// Close the session and the underlying connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Sending link bound to one address
#[async_trait]
pub trait ProducerLink: Send {
    /// Send a message and wait for the broker to take ownership of it
    async fn send(&mut self, message: &Message) -> Result<(), BrokerError>;

    /// Detach the link
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Receiving link bound to one queue
#[async_trait]
pub trait ConsumerLink: Send {
    /// Wait for the next message
    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError>;

    /// Accept a delivery, allowing the broker to remove it from the queue
    async fn accept(&mut self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Detach the link; unsettled deliveries are returned to the queue
    async fn close(&mut self) -> Result<(), BrokerError>;
}
