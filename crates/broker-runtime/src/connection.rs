//! Connection manager with automatic recovery.
//!
//! A [`Connection`] owns one logical session with the broker. A supervisor
//! task watches for connection loss (reported by any operation that sees
//! [`BrokerError::ConnectionLost`]) and reconnects under the configured
//! [`RecoveryPolicy`]. While recovery is in progress every operation
//! suspends instead of failing. When the policy is exhausted the supervisor
//! resolves the connection's [`RecoveryFailure`] exactly once.
//!
//! [`Producer`] and [`Consumer`] handles survive recovery: they re-attach
//! their links to the new session on first use.

use crate::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::message::{AddressName, DeliveryHandle, Message, QueueName, ReceivedMessage};
use crate::recovery::RecoveryPolicy;
use crate::topology::{RoutingType, TopologyManager};
use crate::transport::{BrokerConnector, BrokerSession, ConsumerLink, ProducerLink};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Connectivity state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection lost; the supervisor is retrying under the recovery policy
    Reconnecting,
    /// Recovery policy exhausted; no further attempts are made
    Exhausted,
    Closed,
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Clone)]
pub(crate) struct ActiveSession {
    pub(crate) session: Arc<dyn BrokerSession>,
    /// Incremented on every (re)connect; links remember the generation they
    /// were attached under
    pub(crate) generation: u64,
}

struct SessionSlot {
    active: Option<ActiveSession>,
    generation: u64,
}

struct ConnectionShared {
    endpoint: Endpoint,
    connector: Arc<dyn BrokerConnector>,
    policy: RecoveryPolicy,
    slot: RwLock<SessionSlot>,
    state: watch::Sender<ConnectionState>,
    lost: mpsc::UnboundedSender<ActiveSession>,
}

impl ConnectionShared {
    fn current(&self) -> Option<ActiveSession> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    fn install(&self, session: Box<dyn BrokerSession>) -> u64 {
        let generation = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.generation += 1;
            slot.active = Some(ActiveSession {
                session: Arc::from(session),
                generation: slot.generation,
            });
            slot.generation
        };
        self.state.send_replace(ConnectionState::Connected);
        generation
    }

    fn take_session(&self) -> Option<ActiveSession> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .take()
    }

    /// Record that the session of `generation` is gone.
    ///
    /// Only the first report for the current generation starts recovery;
    /// reports about older sessions are ignored. The abandoned session is
    /// handed to the supervisor, which closes it before reconnecting.
    fn connection_lost(&self, generation: u64, reason: &str) {
        let abandoned = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            let is_current =
                matches!(&slot.active, Some(active) if active.generation == generation);
            if is_current {
                slot.active.take()
            } else {
                None
            }
        };

        let Some(abandoned) = abandoned else {
            return;
        };

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });

        warn!(endpoint = %self.endpoint, generation, reason, "Connection lost");
        let _ = self.lost.send(abandoned);
    }

    /// Wait until a session is available.
    ///
    /// Suspends while the connection is reconnecting; fails once recovery is
    /// exhausted, the connection is closed or `cancel` fires.
    async fn active_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession, BrokerError> {
        let mut states = self.state.subscribe();

        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Some(active) = self.current() {
                        return Ok(active);
                    }
                }
                ConnectionState::Reconnecting => {}
                ConnectionState::Exhausted => {
                    return Err(BrokerError::RecoveryExhausted {
                        attempts: self.policy.retry_count,
                    });
                }
                ConnectionState::Closed => return Err(BrokerError::ConnectionClosed),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::ConnectionClosed);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Creates connections with a shared connector and recovery policy
pub struct ConnectionFactory {
    connector: Arc<dyn BrokerConnector>,
    recovery_policy: RecoveryPolicy,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            recovery_policy: RecoveryPolicy::default(),
        }
    }

    pub fn with_recovery_policy(mut self, recovery_policy: RecoveryPolicy) -> Self {
        self.recovery_policy = recovery_policy;
        self
    }

    pub fn recovery_policy(&self) -> &RecoveryPolicy {
        &self.recovery_policy
    }

    /// Connect to `endpoint`; see [`Connection::connect`]
    pub async fn connect(
        &self,
        endpoint: Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Connection, BrokerError> {
        Connection::connect(
            Arc::clone(&self.connector),
            endpoint,
            self.recovery_policy.clone(),
            cancel,
        )
        .await
    }
}

/// A supervised logical connection to the broker
pub struct Connection {
    shared: Arc<ConnectionShared>,
    supervision: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    failure: Mutex<Option<oneshot::Receiver<BrokerError>>>,
}

impl Connection {
    /// Establish a connection and start recovery supervision.
    ///
    /// The initial connect makes one attempt plus up to
    /// `policy.retry_count` retries, `policy.interval` apart, and fails with
    /// [`BrokerError::ConnectFailed`] when all of them fail. Supervision
    /// stops when `cancel` fires.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        endpoint: Endpoint,
        policy: RecoveryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        info!(
            endpoint = %endpoint,
            transport = connector.transport_name(),
            "Connecting to broker"
        );

        let session = establish(connector.as_ref(), &endpoint, &policy, cancel).await?;

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = oneshot::channel();

        let shared = Arc::new(ConnectionShared {
            endpoint,
            connector,
            policy,
            slot: RwLock::new(SessionSlot {
                active: None,
                generation: 0,
            }),
            state: state_tx,
            lost: lost_tx,
        });

        let generation = shared.install(session);
        info!(endpoint = %shared.endpoint, generation, "Connected to broker");

        let supervision = cancel.child_token();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            lost_rx,
            failure_tx,
            supervision.clone(),
        ));

        Ok(Self {
            shared,
            supervision,
            supervisor: Some(supervisor),
            failure: Mutex::new(Some(failure_rx)),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn recovery_policy(&self) -> &RecoveryPolicy {
        &self.shared.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to connectivity state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Take the terminal recovery-failure signal.
    ///
    /// Returns `None` after the first call; the signal fires at most once.
    pub fn recovery_failure(&self) -> Option<RecoveryFailure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|receiver| RecoveryFailure { receiver })
    }

    pub fn topology_manager(&self) -> TopologyManager<'_> {
        TopologyManager::new(self)
    }

    /// Attach a producer to `address`
    pub async fn create_producer(
        &self,
        address: AddressName,
        routing_type: RoutingType,
        cancel: &CancellationToken,
    ) -> Result<Producer, BrokerError> {
        let mut producer = Producer {
            shared: Arc::clone(&self.shared),
            address,
            routing_type,
            link: None,
        };

        let active = self.shared.active_session(cancel).await?;
        if let Err(error) = producer.attach(&active, cancel).await {
            if let BrokerError::ConnectionLost { message } = &error {
                self.shared.connection_lost(active.generation, message);
            }
            return Err(error);
        }

        info!(
            address = %producer.address,
            routing_type = %producer.routing_type,
            "Producer attached"
        );
        Ok(producer)
    }

    /// Attach a consumer to `queue` on `address`
    pub async fn create_consumer(
        &self,
        address: AddressName,
        queue: QueueName,
        cancel: &CancellationToken,
    ) -> Result<Consumer, BrokerError> {
        let mut consumer = Consumer {
            shared: Arc::clone(&self.shared),
            address,
            queue,
            link: None,
        };

        let active = self.shared.active_session(cancel).await?;
        if let Err(error) = consumer.attach(&active, cancel).await {
            if let BrokerError::ConnectionLost { message } = &error {
                self.shared.connection_lost(active.generation, message);
            }
            return Err(error);
        }

        info!(
            address = %consumer.address,
            queue = %consumer.queue,
            "Consumer attached"
        );
        Ok(consumer)
    }

    /// Stop supervision and close the underlying session
    pub async fn close(mut self) -> Result<(), BrokerError> {
        self.supervision.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }

        let active = self.shared.take_session();
        self.shared.state.send_replace(ConnectionState::Closed);
        info!(endpoint = %self.shared.endpoint, "Connection closed");

        match active {
            Some(active) => active.session.close().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn active_session(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession, BrokerError> {
        self.shared.active_session(cancel).await
    }

    pub(crate) fn connection_lost(&self, generation: u64, reason: &str) {
        self.shared.connection_lost(generation, reason);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.supervision.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Resolves when connection recovery is exhausted.
///
/// Yields the exhaustion error, or `None` when the connection was closed
/// without exhausting recovery.
pub struct RecoveryFailure {
    receiver: oneshot::Receiver<BrokerError>,
}

impl RecoveryFailure {
    /// Cancel `cancel` when recovery is exhausted.
    ///
    /// The returned task ends when either the failure fires or `cancel` is
    /// cancelled for another reason.
    pub fn cancel_on_failure(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                failure = self => {
                    if let Some(error) = failure {
                        error!(error = %error, "Connection recovery failed; cancelling all loops");
                        cancel.cancel();
                    }
                }
            }
        })
    }
}

impl Future for RecoveryFailure {
    type Output = Option<BrokerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.ok())
    }
}

// ============================================================================
// Connection Establishment and Supervision
// ============================================================================

async fn establish(
    connector: &dyn BrokerConnector,
    endpoint: &Endpoint,
    policy: &RecoveryPolicy,
    cancel: &CancellationToken,
) -> Result<Box<dyn BrokerSession>, BrokerError> {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            result = connector.connect(endpoint) => result,
        };

        let error = match result {
            Ok(session) => return Ok(session),
            Err(error) => error,
        };

        if !error.is_transient() || !policy.should_retry(attempt) {
            return Err(BrokerError::ConnectFailed {
                endpoint: endpoint.to_string(),
                attempts: attempt + 1,
                message: error.to_string(),
            });
        }

        let delay = policy.calculate_delay(attempt);
        warn!(
            endpoint = %endpoint,
            attempt = attempt + 1,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Connection attempt failed"
        );
        attempt += 1;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn supervise(
    shared: Arc<ConnectionShared>,
    mut lost: mpsc::UnboundedReceiver<ActiveSession>,
    failure: oneshot::Sender<BrokerError>,
    shutdown: CancellationToken,
) {
    let mut failure = Some(failure);

    loop {
        let abandoned = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            lost = lost.recv() => match lost {
                Some(abandoned) => abandoned,
                None => break,
            },
        };

        debug!(
            endpoint = %shared.endpoint,
            generation = abandoned.generation,
            "Starting connection recovery"
        );

        // Best effort; the peer may already be gone
        let closed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            closed = abandoned.session.close() => closed,
        };
        if let Err(error) = closed {
            debug!(
                endpoint = %shared.endpoint,
                generation = abandoned.generation,
                error = %error,
                "Closing the lost session failed"
            );
        }
        drop(abandoned);

        match reconnect(&shared, &shutdown).await {
            Ok(generation) => {
                info!(endpoint = %shared.endpoint, generation, "Connection recovered");
            }
            Err(BrokerError::Cancelled) => break,
            Err(error) => {
                shared.state.send_replace(ConnectionState::Exhausted);
                error!(endpoint = %shared.endpoint, error = %error, "Connection recovery exhausted");
                if let Some(failure) = failure.take() {
                    let _ = failure.send(error);
                }
                break;
            }
        }
    }

    debug!(endpoint = %shared.endpoint, "Connection supervisor stopped");
}

async fn reconnect(
    shared: &ConnectionShared,
    shutdown: &CancellationToken,
) -> Result<u64, BrokerError> {
    let policy = &shared.policy;
    let mut attempt: u32 = 0;

    while policy.should_retry(attempt) {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(BrokerError::Cancelled),
            _ = tokio::time::sleep(policy.calculate_delay(attempt)) => {}
        }

        info!(
            endpoint = %shared.endpoint,
            attempt = attempt + 1,
            max_attempts = policy.retry_count,
            "Reconnecting to broker"
        );

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(BrokerError::Cancelled),
            result = shared.connector.connect(&shared.endpoint) => result,
        };

        match result {
            Ok(session) => return Ok(shared.install(session)),
            Err(error) => {
                warn!(
                    endpoint = %shared.endpoint,
                    attempt = attempt + 1,
                    error = %error,
                    "Reconnect attempt failed"
                );
            }
        }

        attempt += 1;
    }

    Err(BrokerError::RecoveryExhausted { attempts: attempt })
}

// ============================================================================
// Producer and Consumer Handles
// ============================================================================

/// Sends messages to one address; re-attaches after connection recovery
pub struct Producer {
    shared: Arc<ConnectionShared>,
    address: AddressName,
    routing_type: RoutingType,
    link: Option<(u64, Box<dyn ProducerLink>)>,
}

impl Producer {
    pub fn address(&self) -> &AddressName {
        &self.address
    }

    pub fn routing_type(&self) -> RoutingType {
        self.routing_type
    }

    /// Send `message`, suspending while the connection is reconnecting.
    ///
    /// A send interrupted by connection loss fails with
    /// [`BrokerError::ConnectionLost`] and starts recovery; it is not retried
    /// here.
    pub async fn send(
        &mut self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let active = self.shared.active_session(cancel).await?;

        let result = match self.attach(&active, cancel).await {
            Ok(link) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BrokerError::Cancelled),
                result = link.send(message) => result,
            },
            Err(error) => Err(error),
        };

        if let Err(BrokerError::ConnectionLost { message: reason }) = &result {
            self.link = None;
            self.shared.connection_lost(active.generation, reason);
        }

        result
    }

    /// Detach the producer link
    pub async fn close(mut self) -> Result<(), BrokerError> {
        match self.link.take() {
            Some((_, mut link)) => link.close().await,
            None => Ok(()),
        }
    }

    async fn attach(
        &mut self,
        active: &ActiveSession,
        cancel: &CancellationToken,
    ) -> Result<&mut Box<dyn ProducerLink>, BrokerError> {
        let attached = matches!(&self.link, Some((generation, _)) if *generation == active.generation);

        if !attached {
            let link = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                link = active.session.create_producer(&self.address, self.routing_type) => link?,
            };
            debug!(
                address = %self.address,
                generation = active.generation,
                "Producer link attached"
            );
            self.link = Some((active.generation, link));
        }

        self.link
            .as_mut()
            .map(|(_, link)| link)
            .ok_or(BrokerError::ConnectionClosed)
    }
}

/// Receives from one queue; re-attaches after connection recovery
pub struct Consumer {
    shared: Arc<ConnectionShared>,
    address: AddressName,
    queue: QueueName,
    link: Option<(u64, Box<dyn ConsumerLink>)>,
}

impl Consumer {
    pub fn address(&self) -> &AddressName {
        &self.address
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Wait for the next message.
    ///
    /// Connection loss does not surface here: the receive suspends until the
    /// connection recovers and then continues on a re-attached link. Fails
    /// with [`BrokerError::RecoveryExhausted`] when recovery gives up; other
    /// link failures are returned for the caller to report.
    pub async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<DeliveryHandle, BrokerError> {
        loop {
            let active = self.shared.active_session(cancel).await?;

            let result = match self.attach(&active, cancel).await {
                Ok(link) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(BrokerError::Cancelled),
                    result = link.receive() => result,
                },
                Err(error) => Err(error),
            };

            match result {
                Ok(message) => return Ok(DeliveryHandle::new(message, active.generation)),
                Err(BrokerError::ConnectionLost { message: reason }) => {
                    self.link = None;
                    self.shared.connection_lost(active.generation, &reason);
                    debug!(queue = %self.queue, "Receive suspended until the connection recovers");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Accept `delivery`, committing its removal from the queue.
    ///
    /// Returns the acknowledged message. Cancellation does not interrupt the
    /// acknowledgment of a delivery already in hand. Deliveries received before a
    /// connection recovery cannot be accepted on the new link; the broker
    /// redelivers them instead.
    pub async fn accept(
        &mut self,
        delivery: DeliveryHandle,
    ) -> Result<ReceivedMessage, BrokerError> {
        let generation = delivery.link_generation();
        let link = match self.link.as_mut() {
            Some((link_generation, link)) if *link_generation == generation => link,
            _ => {
                return Err(BrokerError::AcknowledgeFailed {
                    message: format!(
                        "delivery {} was received on a link that no longer exists",
                        delivery.tag()
                    ),
                })
            }
        };

        match link.accept(delivery.tag()).await {
            Ok(()) => Ok(delivery.into_message()),
            Err(BrokerError::ConnectionLost { message: reason }) => {
                self.link = None;
                self.shared.connection_lost(generation, &reason);
                Err(BrokerError::AcknowledgeFailed { message: reason })
            }
            Err(error) => Err(error),
        }
    }

    /// Detach the consumer link; unsettled deliveries return to the queue
    pub async fn close(mut self) -> Result<(), BrokerError> {
        match self.link.take() {
            Some((_, mut link)) => link.close().await,
            None => Ok(()),
        }
    }

    async fn attach(
        &mut self,
        active: &ActiveSession,
        cancel: &CancellationToken,
    ) -> Result<&mut Box<dyn ConsumerLink>, BrokerError> {
        let attached = matches!(&self.link, Some((generation, _)) if *generation == active.generation);

        if !attached {
            let link = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                link = active.session.create_consumer(&self.address, &self.queue) => link?,
            };
            debug!(
                queue = %self.queue,
                generation = active.generation,
                "Consumer link attached"
            );
            self.link = Some((active.generation, link));
        }

        self.link
            .as_mut()
            .map(|(_, link)| link)
            .ok_or(BrokerError::ConnectionClosed)
    }
}
