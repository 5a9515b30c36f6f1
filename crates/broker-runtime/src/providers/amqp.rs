//! AMQP 1.0 transport for ActiveMQ Artemis and compatible brokers.
//!
//! Built on `fe2o3-amqp`:
//! - one AMQP connection and one session per [`BrokerSession`]
//! - producers attach a sender to the address; multicast addresses are
//!   requested with the `topic` target capability
//! - consumers attach a receiver to the fully qualified queue name
//!   (`address::queue`) and settle deliveries with `accept`
//! - queue declaration is a `createQueue` request to the broker's
//!   management address
//!
//! Failures are classified before they leave this module. Session and
//! connection failures, and links the peer detached without a reason, become
//! [`BrokerError::ConnectionLost`] so the connection manager can recover.
//! Remote refusals map to the matching topology error, and undecodable
//! deliveries are rejected and reported as [`BrokerError::Decode`].

use crate::endpoint::Endpoint;
use crate::error::{BrokerError, DecodeError};
use crate::message::{AddressName, DeliveryTag, Message, QueueName, ReceivedMessage, Timestamp};
use crate::topology::{QueueConfiguration, RoutingType};
use crate::transport::{BrokerConnector, BrokerSession, ConsumerLink, ProducerLink};
use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::{
    DetachError, DispositionError, LinkStateError, ReceiverAttachError, RecvError,
    SendError, SenderAttachError,
};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::definitions::{self, AmqpError, ErrorCondition, LinkError};
use fe2o3_amqp::types::messaging::{ApplicationProperties, Properties, Target};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

/// Artemis management address for broker-level operations
const MANAGEMENT_ADDRESS: &str = "activemq.management";

const RESOURCE_NAME_PROPERTY: &str = "_AMQ_ResourceName";
const OPERATION_NAME_PROPERTY: &str = "_AMQ_OperationName";

/// Target capability selecting multicast routing on Artemis
const TOPIC_CAPABILITY: &str = "topic";

fn link_name(role: &str) -> String {
    format!("{}-{}", role, uuid::Uuid::new_v4())
}

// ============================================================================
// Error Classification
// ============================================================================

fn connection_lost(context: &str, error: impl std::fmt::Display) -> BrokerError {
    BrokerError::ConnectionLost {
        message: format!("{}: {}", context, error),
    }
}

/// The link a failure happened on; picks the error for failures that leave
/// the session intact
#[derive(Debug, Clone, Copy)]
enum LinkRole<'a> {
    Producer(&'a AddressName),
    Consumer(&'a QueueName),
    Management(&'a QueueName),
}

impl LinkRole<'_> {
    fn failed(&self, message: String) -> BrokerError {
        match self {
            Self::Producer(address) => BrokerError::SendFailed {
                address: address.to_string(),
                message,
            },
            Self::Consumer(queue) => BrokerError::ReceiveFailed {
                queue: queue.to_string(),
                message,
            },
            Self::Management(queue) => BrokerError::ProvisionFailed {
                queue: queue.to_string(),
                message,
            },
        }
    }

    fn not_found(&self) -> BrokerError {
        match self {
            Self::Producer(address) => BrokerError::AddressNotFound {
                address: address.to_string(),
            },
            Self::Consumer(queue) | Self::Management(queue) => BrokerError::QueueNotFound {
                queue: queue.to_string(),
            },
        }
    }

    fn locked(&self, message: String) -> BrokerError {
        match self {
            Self::Consumer(queue) => BrokerError::ExclusiveConsumerBound {
                queue: queue.to_string(),
            },
            _ => self.failed(message),
        }
    }
}

/// Map an error condition sent by the peer
fn remote_error(role: LinkRole<'_>, context: &str, error: &definitions::Error) -> BrokerError {
    let message = match &error.description {
        Some(description) => format!("{}: {:?}: {}", context, error.condition, description),
        None => format!("{}: {:?}", context, error.condition),
    };

    match &error.condition {
        ErrorCondition::AmqpError(AmqpError::NotFound) => role.not_found(),
        ErrorCondition::AmqpError(AmqpError::ResourceLocked)
        | ErrorCondition::LinkError(LinkError::Stolen) => role.locked(message),
        ErrorCondition::ConnectionError(_)
        | ErrorCondition::SessionError(_)
        | ErrorCondition::LinkError(LinkError::DetachForced) => {
            BrokerError::ConnectionLost { message }
        }
        _ => role.failed(message),
    }
}

fn link_state_error(role: LinkRole<'_>, context: &str, error: LinkStateError) -> BrokerError {
    match error {
        LinkStateError::RemoteDetachedWithError(remote)
        | LinkStateError::RemoteClosedWithError(remote) => remote_error(role, context, &remote),
        other => connection_lost(context, other),
    }
}

fn sender_attach_error(role: LinkRole<'_>, error: SenderAttachError) -> BrokerError {
    let context = "sender attach failed";
    match error {
        SenderAttachError::IllegalSessionState => connection_lost(context, error),
        SenderAttachError::RemoteClosedWithError(remote) => remote_error(role, context, &remote),
        other => role.failed(format!("{}: {}", context, other)),
    }
}

fn receiver_attach_error(role: LinkRole<'_>, error: ReceiverAttachError) -> BrokerError {
    let context = "receiver attach failed";
    match error {
        ReceiverAttachError::IllegalSessionState => connection_lost(context, error),
        ReceiverAttachError::RemoteClosedWithError(remote) => remote_error(role, context, &remote),
        other => role.failed(format!("{}: {}", context, other)),
    }
}

fn send_error(role: LinkRole<'_>, error: SendError) -> BrokerError {
    let context = "send failed";
    match error {
        SendError::LinkStateError(state) => link_state_error(role, context, state),
        SendError::Detached(detach) => link_state_error(role, context, detach.into()),
        other => role.failed(format!("{}: {}", context, other)),
    }
}

fn recv_error(role: LinkRole<'_>, error: RecvError) -> BrokerError {
    let context = "receive failed";
    match error {
        RecvError::LinkStateError(state) => link_state_error(role, context, state),
        RecvError::MessageDecode(decode) => undecodable(decode.to_string()),
        other => role.failed(format!("{}: {}", context, other)),
    }
}

/// A delivery whose body is not a string; reported without touching the
/// connection
fn undecodable(message: String) -> BrokerError {
    BrokerError::Decode(DecodeError::Body { message })
}

fn disposition_error(role: LinkRole<'_>, error: DispositionError) -> BrokerError {
    link_state_error(role, "accept failed", error.into())
}

fn detach_error(role: LinkRole<'_>, error: DetachError) -> BrokerError {
    link_state_error(role, "link detach failed", error.into())
}

// ============================================================================
// Connector
// ============================================================================

/// Opens AMQP 1.0 sessions
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    container_id: String,
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new(format!("broker-client-{}", uuid::Uuid::new_v4()))
    }
}

impl AmqpConnector {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let url = endpoint.url();

        let mut connection = Connection::open(self.container_id.clone(), url.as_str())
            .await
            .map_err(|e| {
                debug!(endpoint = %endpoint, error = %e, "AMQP connection open failed");
                BrokerError::ConnectionRefused {
                    endpoint: endpoint.to_string(),
                }
            })?;

        let session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "AMQP session begin failed");
                let _ = connection.close().await;
                return Err(BrokerError::ConnectionRefused {
                    endpoint: endpoint.to_string(),
                });
            }
        };

        debug!(endpoint = %endpoint, container_id = %self.container_id, "AMQP session started");

        Ok(Box::new(AmqpSession {
            connection: Mutex::new(Some(connection)),
            session: Mutex::new(Some(session)),
        }))
    }

    fn transport_name(&self) -> &'static str {
        "amqp"
    }
}

// ============================================================================
// Session
// ============================================================================

struct AmqpSession {
    connection: Mutex<Option<ConnectionHandle<()>>>,
    session: Mutex<Option<SessionHandle<()>>>,
}

/// `createQueue` payload understood by the Artemis management API
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct CreateQueueRequest<'a> {
    name: &'a str,
    address: &'a str,
    routing_type: RoutingType,
    durable: bool,
    exclusive: bool,
    auto_create_address: bool,
    auto_delete: bool,
    auto_delete_message_count: i64,
    auto_delete_delay: u64,
}

impl<'a> From<&'a QueueConfiguration> for CreateQueueRequest<'a> {
    fn from(config: &'a QueueConfiguration) -> Self {
        Self {
            name: config.name.as_str(),
            address: config.address.as_str(),
            routing_type: config.routing_type,
            durable: config.durable,
            exclusive: config.exclusive,
            auto_create_address: config.auto_create_address,
            auto_delete: config.auto_delete,
            auto_delete_message_count: config.auto_delete_message_count,
            auto_delete_delay: config.auto_delete_delay.as_millis() as u64,
        }
    }
}

impl AmqpSession {
    fn management_body(config: &QueueConfiguration) -> Result<String, BrokerError> {
        let request = serde_json::to_string(&CreateQueueRequest::from(config)).map_err(|e| {
            BrokerError::ProvisionFailed {
                queue: config.name.to_string(),
                message: format!("failed to encode queue configuration: {}", e),
            }
        })?;

        // Operation arguments: (queueConfiguration, ignoreIfExists)
        serde_json::to_string(&(request, false)).map_err(|e| BrokerError::ProvisionFailed {
            queue: config.name.to_string(),
            message: format!("failed to encode management request: {}", e),
        })
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, config: &QueueConfiguration) -> Result<(), BrokerError> {
        let body = Self::management_body(config)?;

        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(BrokerError::ConnectionClosed)?;

        let role = LinkRole::Management(&config.name);
        let mut sender = Sender::attach(session, link_name("management"), MANAGEMENT_ADDRESS)
            .await
            .map_err(|e| sender_attach_error(role, e))?;

        let request = fe2o3_amqp::types::messaging::Message::builder()
            .application_properties(
                ApplicationProperties::builder()
                    .insert(RESOURCE_NAME_PROPERTY, "broker")
                    .insert(OPERATION_NAME_PROPERTY, "createQueue")
                    .build(),
            )
            .value(body)
            .build();

        let outcome = sender
            .send(request)
            .await
            .map_err(|e| send_error(role, e))?;

        if let Err(e) = sender.close().await {
            warn!(error = %e, "Failed to detach management link");
        }

        outcome
            .accepted_or_else(|outcome| outcome)
            .map(|_| ())
            .map_err(|outcome| BrokerError::ProvisionFailed {
                queue: config.name.to_string(),
                message: format!("broker rejected createQueue: {:?}", outcome),
            })
    }

    async fn create_producer(
        &self,
        address: &AddressName,
        routing_type: RoutingType,
    ) -> Result<Box<dyn ProducerLink>, BrokerError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(BrokerError::ConnectionClosed)?;

        let target = match routing_type {
            RoutingType::Multicast => Target::builder()
                .address(address.as_str().to_string())
                .capabilities(vec![fe2o3_amqp::types::primitives::Symbol::from(TOPIC_CAPABILITY)])
                .build(),
            RoutingType::Anycast => Target::builder()
                .address(address.as_str().to_string())
                .build(),
        };

        let sender = Sender::builder()
            .name(link_name("producer"))
            .target(target)
            .attach(session)
            .await
            .map_err(|e| sender_attach_error(LinkRole::Producer(address), e))?;

        Ok(Box::new(AmqpProducerLink {
            sender: Some(sender),
            address: address.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        address: &AddressName,
        queue: &QueueName,
    ) -> Result<Box<dyn ConsumerLink>, BrokerError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(BrokerError::ConnectionClosed)?;

        let receiver = Receiver::attach(session, link_name("consumer"), queue.qualified(address))
            .await
            .map_err(|e| receiver_attach_error(LinkRole::Consumer(queue), e))?;

        Ok(Box::new(AmqpConsumerLink {
            receiver: Some(receiver),
            queue: queue.clone(),
            pending: HashMap::new(),
            next_tag: 0,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(e) = session.end().await {
                debug!(error = %e, "AMQP session end failed");
            }
        }

        if let Some(mut connection) = self.connection.lock().await.take() {
            connection
                .close()
                .await
                .map_err(|e| connection_lost("connection close failed", e))?;
        }

        Ok(())
    }
}

// ============================================================================
// Links
// ============================================================================

struct AmqpProducerLink {
    sender: Option<Sender>,
    address: AddressName,
}

#[async_trait]
impl ProducerLink for AmqpProducerLink {
    async fn send(&mut self, message: &Message) -> Result<(), BrokerError> {
        let sender = self.sender.as_mut().ok_or(BrokerError::ConnectionClosed)?;
        let body = message.body_as_str()?.to_string();

        let mut properties = ApplicationProperties::builder();
        for (key, value) in &message.properties {
            properties = properties.insert(key.clone(), value.clone());
        }

        let amqp_message = fe2o3_amqp::types::messaging::Message::builder()
            .properties(
                Properties::builder()
                    .message_id(message.message_id.to_string())
                    .build(),
            )
            .application_properties(properties.build())
            .value(body)
            .build();

        let outcome = sender
            .send(amqp_message)
            .await
            .map_err(|e| send_error(LinkRole::Producer(&self.address), e))?;

        outcome
            .accepted_or_else(|outcome| outcome)
            .map(|_| ())
            .map_err(|outcome| BrokerError::SendFailed {
                address: self.address.to_string(),
                message: format!("message not accepted: {:?}", outcome),
            })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if let Some(sender) = self.sender.take() {
            sender
                .close()
                .await
                .map_err(|e| detach_error(LinkRole::Producer(&self.address), e))?;
        }
        Ok(())
    }
}

struct AmqpConsumerLink {
    receiver: Option<Receiver>,
    queue: QueueName,
    pending: HashMap<DeliveryTag, Delivery<String>>,
    next_tag: u64,
}

#[async_trait]
impl ConsumerLink for AmqpConsumerLink {
    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError> {
        let receiver = self.receiver.as_mut().ok_or(BrokerError::ConnectionClosed)?;

        let role = LinkRole::Consumer(&self.queue);

        let delivery = match receiver.recv::<String>().await {
            Ok(delivery) => delivery,
            Err(RecvError::MessageDecode(decode)) => {
                let message = decode.to_string();
                warn!(queue = %self.queue, error = %message, "Rejecting undecodable delivery");
                let condition = definitions::Error::new(
                    AmqpError::DecodeError,
                    Some(message.clone()),
                    None,
                );
                if let Err(e) = receiver.reject(decode.info, condition).await {
                    return Err(link_state_error(role, "reject failed", e.into()));
                }
                return Err(undecodable(message));
            }
            Err(e) => return Err(recv_error(role, e)),
        };

        self.next_tag += 1;
        let tag = DeliveryTag::new(self.next_tag);

        // Header delivery count is the number of prior failed attempts
        let delivery_count = delivery
            .message()
            .header
            .as_ref()
            .map(|header| header.delivery_count)
            .unwrap_or(0)
            .saturating_add(1);

        let message = Message::new(Bytes::from(delivery.body().clone()));
        trace!(queue = %self.queue, tag = %tag, "AMQP delivery received");
        self.pending.insert(tag, delivery);

        Ok(ReceivedMessage {
            message,
            tag,
            delivery_count,
            received_at: Timestamp::now(),
        })
    }

    async fn accept(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let receiver = self.receiver.as_mut().ok_or(BrokerError::ConnectionClosed)?;
        let delivery = self
            .pending
            .remove(&tag)
            .ok_or_else(|| BrokerError::DeliveryNotFound {
                tag: tag.to_string(),
            })?;

        receiver
            .accept(&delivery)
            .await
            .map_err(|e| disposition_error(LinkRole::Consumer(&self.queue), e))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.pending.clear();
        if let Some(receiver) = self.receiver.take() {
            receiver
                .close()
                .await
                .map_err(|e| detach_error(LinkRole::Consumer(&self.queue), e))?;
        }
        Ok(())
    }
}
