//! In-memory broker for testing and development.
//!
//! This module provides a broker fake that behaves like a multicast-capable
//! message broker:
//! - Addresses with bound queues; multicast copies each message to every queue
//! - Exclusive queues, duplicate-declaration rejection and delayed auto-delete
//! - Unsettled deliveries that return to the queue when their link goes away
//! - Fault injection: per-operation errors, dropped and refused connections
//! - Counters and an event journal for test assertions
//!
//! Every clone of an [`InMemoryBroker`] shares the same state, so a test can
//! keep one handle for inspection while the connection manager owns another
//! as its [`BrokerConnector`].

use crate::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::message::{AddressName, DeliveryTag, Message, QueueName, ReceivedMessage, Timestamp};
use crate::topology::{QueueConfiguration, RoutingType};
use crate::transport::{BrokerConnector, BrokerSession, ConsumerLink, ProducerLink};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Broker operations that accept injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOperation {
    Declare,
    Send,
    Receive,
    Accept,
}

/// Observable broker-side events, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { connection: u64 },
    Disconnected { connection: u64 },
    QueueDeclared { address: AddressName, queue: QueueName },
    QueueDeleted { queue: QueueName },
    Sent { address: AddressName, body: Bytes },
    Delivered { queue: QueueName, tag: DeliveryTag },
    Accepted { queue: QueueName, tag: DeliveryTag, body: Bytes },
    Requeued { queue: QueueName, tag: DeliveryTag },
}

/// Broker-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connection attempts, including refused ones
    pub connect_attempts: u64,
    /// Network operations issued on sessions and links
    pub operations: u64,
    /// Deliveries settled by an accept
    pub accepted: u64,
    /// Sessions closed by the client
    pub session_closes: u64,
}

/// Events kept by [`InMemoryBroker::journal`] unless configured otherwise
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

// ============================================================================
// Internal Storage Structures
// ============================================================================

enum Refusal {
    None,
    Next(u32),
    Always,
}

struct AddressState {
    routing_type: RoutingType,
    queues: Vec<QueueName>,
    next_anycast: usize,
}

struct StoredMessage {
    message: Message,
    delivery_count: u32,
}

struct InFlight {
    consumer: u64,
    stored: StoredMessage,
}

struct QueueState {
    config: QueueConfiguration,
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    consumers: HashSet<u64>,
    /// Bumped whenever a pending auto-delete must be abandoned
    deletion_epoch: u64,
}

struct ConsumerState {
    connection: u64,
    queue: QueueName,
}

/// Bounded event log; the oldest events are evicted first
struct Journal {
    events: VecDeque<BrokerEvent>,
    capacity: usize,
}

impl Journal {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, event: BrokerEvent) {
        if self.capacity == 0 {
            return;
        }
        self.truncate(self.capacity - 1);
        self.events.push_back(event);
    }

    fn truncate(&mut self, len: usize) {
        while self.events.len() > len {
            self.events.pop_front();
        }
    }
}

struct BrokerState {
    addresses: HashMap<AddressName, AddressState>,
    queues: HashMap<QueueName, QueueState>,
    consumers: HashMap<u64, ConsumerState>,
    live_connections: HashSet<u64>,
    credentials: Option<(String, String)>,
    refusal: Refusal,
    faults: HashMap<BrokerOperation, VecDeque<BrokerError>>,
    stats: BrokerStats,
    journal: Journal,
    next_id: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            addresses: HashMap::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            live_connections: HashSet::new(),
            credentials: None,
            refusal: Refusal::None,
            faults: HashMap::new(),
            stats: BrokerStats::default(),
            journal: Journal::new(DEFAULT_JOURNAL_CAPACITY),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Count a network operation and apply liveness and injected faults
    fn begin(
        &mut self,
        connection: u64,
        operation: Option<BrokerOperation>,
    ) -> Result<(), BrokerError> {
        self.stats.operations += 1;

        if !self.live_connections.contains(&connection) {
            return Err(BrokerError::ConnectionLost {
                message: format!("connection {} was dropped by the broker", connection),
            });
        }

        if let Some(error) = operation
            .and_then(|operation| self.faults.get_mut(&operation))
            .and_then(VecDeque::pop_front)
        {
            debug!(connection, ?operation, error = %error, "Injecting broker fault");
            return Err(error);
        }

        Ok(())
    }

    fn declare_queue(&mut self, config: &QueueConfiguration) -> Result<(), BrokerError> {
        if self.queues.contains_key(&config.name) {
            return Err(BrokerError::QueueAlreadyExists {
                queue: config.name.to_string(),
            });
        }

        if !self.addresses.contains_key(&config.address) {
            if !config.auto_create_address {
                return Err(BrokerError::AddressNotFound {
                    address: config.address.to_string(),
                });
            }

            self.addresses.insert(
                config.address.clone(),
                AddressState {
                    routing_type: config.routing_type,
                    queues: Vec::new(),
                    next_anycast: 0,
                },
            );
        }

        let Some(address) = self.addresses.get_mut(&config.address) else {
            return Err(BrokerError::AddressNotFound {
                address: config.address.to_string(),
            });
        };

        address.queues.push(config.name.clone());
        self.queues.insert(
            config.name.clone(),
            QueueState {
                config: config.clone(),
                messages: VecDeque::new(),
                in_flight: HashMap::new(),
                consumers: HashSet::new(),
                deletion_epoch: 0,
            },
        );
        self.journal.push(BrokerEvent::QueueDeclared {
            address: config.address.clone(),
            queue: config.name.clone(),
        });

        Ok(())
    }

    /// Route `message` to the queues bound to `address`, creating the address
    /// on first use. Returns the number of queues that received a copy.
    fn route(&mut self, address: &AddressName, routing_type: RoutingType, message: &Message) -> usize {
        let state = self
            .addresses
            .entry(address.clone())
            .or_insert_with(|| AddressState {
                routing_type,
                queues: Vec::new(),
                next_anycast: 0,
            });

        let targets: Vec<QueueName> = match state.routing_type {
            RoutingType::Multicast => state.queues.clone(),
            RoutingType::Anycast if state.queues.is_empty() => Vec::new(),
            RoutingType::Anycast => {
                let index = state.next_anycast % state.queues.len();
                state.next_anycast = state.next_anycast.wrapping_add(1);
                vec![state.queues[index].clone()]
            }
        };

        for queue in &targets {
            if let Some(queue) = self.queues.get_mut(queue) {
                queue.messages.push_back(StoredMessage {
                    message: message.clone(),
                    delivery_count: 0,
                });
            }
        }

        self.journal.push(BrokerEvent::Sent {
            address: address.clone(),
            body: message.body.clone(),
        });

        targets.len()
    }

    fn attach_consumer(
        &mut self,
        connection: u64,
        queue_name: &QueueName,
    ) -> Result<u64, BrokerError> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: queue_name.to_string(),
            })?;

        if queue.config.exclusive && !queue.consumers.is_empty() {
            return Err(BrokerError::ExclusiveConsumerBound {
                queue: queue_name.to_string(),
            });
        }

        self.next_id += 1;
        let consumer = self.next_id;
        queue.consumers.insert(consumer);
        queue.deletion_epoch += 1;
        self.consumers.insert(
            consumer,
            ConsumerState {
                connection,
                queue: queue_name.clone(),
            },
        );

        Ok(consumer)
    }

    /// Detach `consumer`, returning its unsettled deliveries to the head of
    /// the queue. Returns an auto-delete request when the queue became idle.
    fn detach_consumer(&mut self, consumer: u64) -> Option<PendingDeletion> {
        let state = self.consumers.remove(&consumer)?;
        let queue = self.queues.get_mut(&state.queue)?;
        queue.consumers.remove(&consumer);

        let mut returned: Vec<(DeliveryTag, StoredMessage)> = Vec::new();
        let tags: Vec<DeliveryTag> = queue
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(in_flight) = queue.in_flight.remove(&tag) {
                returned.push((tag, in_flight.stored));
            }
        }

        // Oldest delivery ends up at the head
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(tag.value()));
        for (tag, stored) in returned {
            queue.messages.push_front(stored);
            self.journal.push(BrokerEvent::Requeued {
                queue: state.queue.clone(),
                tag,
            });
        }

        if queue.consumers.is_empty() && queue.config.allows_auto_delete_with(queue.messages.len()) {
            queue.deletion_epoch += 1;
            return Some(PendingDeletion {
                queue: state.queue,
                epoch: queue.deletion_epoch,
                delay: queue.config.auto_delete_delay,
            });
        }

        None
    }

    fn drop_connection(&mut self, connection: u64) -> Vec<PendingDeletion> {
        if !self.live_connections.remove(&connection) {
            return Vec::new();
        }

        self.journal.push(BrokerEvent::Disconnected { connection });

        let consumers: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, state)| state.connection == connection)
            .map(|(consumer, _)| *consumer)
            .collect();

        consumers
            .into_iter()
            .filter_map(|consumer| self.detach_consumer(consumer))
            .collect()
    }

    fn delete_queue(&mut self, queue_name: &QueueName) {
        if let Some(queue) = self.queues.remove(queue_name) {
            if let Some(address) = self.addresses.get_mut(&queue.config.address) {
                address.queues.retain(|name| name != queue_name);
            }
            self.journal.push(BrokerEvent::QueueDeleted {
                queue: queue_name.clone(),
            });
        }
    }
}

struct PendingDeletion {
    queue: QueueName,
    epoch: u64,
    delay: std::time::Duration,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl BrokerInner {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Mutate the state and wake every waiting receiver
    fn update<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let result = self.with_state(f);
        self.changed.notify_waiters();
        result
    }
}

fn schedule_deletions(inner: &Arc<BrokerInner>, deletions: Vec<PendingDeletion>) {
    if deletions.is_empty() {
        return;
    }

    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            debug!("No runtime available; skipping queue auto-delete");
            return;
        }
    };

    for deletion in deletions {
        let inner = Arc::clone(inner);
        handle.spawn(async move {
            tokio::time::sleep(deletion.delay).await;
            inner.update(|state| {
                let idle = state.queues.get(&deletion.queue).is_some_and(|queue| {
                    queue.deletion_epoch == deletion.epoch && queue.consumers.is_empty()
                });
                if idle {
                    info!(queue = %deletion.queue, "Auto-deleting idle queue");
                    state.delete_queue(&deletion.queue);
                }
            });
        });
    }
}

// ============================================================================
// In-Memory Broker
// ============================================================================

/// In-memory broker implementing [`BrokerConnector`]
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Require these credentials on connect
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner
            .with_state(|state| state.credentials = Some((username.into(), password.into())));
        self
    }

    /// Keep at most `capacity` journal events; zero disables the journal
    pub fn with_journal_capacity(self, capacity: usize) -> Self {
        self.inner.with_state(|state| {
            state.journal.capacity = capacity;
            state.journal.truncate(capacity);
        });
        self
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Fail the next `operation` with `error`; repeated calls queue up
    pub fn fail_next(&self, operation: BrokerOperation, error: BrokerError) {
        self.inner.with_state(|state| {
            state
                .faults
                .entry(operation)
                .or_default()
                .push_back(error)
        });
    }

    /// Drop every live connection; in-flight operations fail with
    /// [`BrokerError::ConnectionLost`]
    pub fn drop_connections(&self) {
        let deletions = self.inner.update(|state| {
            let connections: Vec<u64> = state.live_connections.iter().copied().collect();
            connections
                .into_iter()
                .flat_map(|connection| state.drop_connection(connection))
                .collect::<Vec<_>>()
        });
        info!("Dropped all broker connections");
        schedule_deletions(&self.inner, deletions);
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&self, count: u32) {
        self.inner
            .with_state(|state| state.refusal = Refusal::Next(count));
    }

    /// Refuse every connection attempt until [`Self::accept_connections`]
    pub fn refuse_all_connections(&self) {
        self.inner.with_state(|state| state.refusal = Refusal::Always);
    }

    pub fn accept_connections(&self) {
        self.inner.with_state(|state| state.refusal = Refusal::None);
    }

    // ------------------------------------------------------------------------
    // Direct access
    // ------------------------------------------------------------------------

    /// Route `message` to `address` without a client connection
    pub fn publish(&self, address: &AddressName, message: Message) -> usize {
        self.inner
            .update(|state| state.route(address, RoutingType::Multicast, &message))
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> BrokerStats {
        self.inner.with_state(|state| state.stats)
    }

    /// The most recent events, oldest first
    pub fn journal(&self) -> Vec<BrokerEvent> {
        self.inner
            .with_state(|state| state.journal.events.iter().cloned().collect())
    }

    pub fn has_queue(&self, queue: &QueueName) -> bool {
        self.inner.with_state(|state| state.queues.contains_key(queue))
    }

    pub fn has_address(&self, address: &AddressName) -> bool {
        self.inner
            .with_state(|state| state.addresses.contains_key(address))
    }

    /// Queues bound to `address`, in declaration order
    pub fn bound_queues(&self, address: &AddressName) -> Vec<QueueName> {
        self.inner.with_state(|state| {
            state
                .addresses
                .get(address)
                .map(|address| address.queues.clone())
                .unwrap_or_default()
        })
    }

    /// Messages waiting for delivery in `queue`
    pub fn queue_depth(&self, queue: &QueueName) -> Option<usize> {
        self.inner
            .with_state(|state| state.queues.get(queue).map(|queue| queue.messages.len()))
    }

    /// Delivered but unsettled messages of `queue`
    pub fn in_flight_count(&self, queue: &QueueName) -> Option<usize> {
        self.inner
            .with_state(|state| state.queues.get(queue).map(|queue| queue.in_flight.len()))
    }

    pub fn consumer_count(&self, queue: &QueueName) -> Option<usize> {
        self.inner
            .with_state(|state| state.queues.get(queue).map(|queue| queue.consumers.len()))
    }

    pub fn live_connections(&self) -> usize {
        self.inner.with_state(|state| state.live_connections.len())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let connection = self.inner.with_state(|state| {
            state.stats.connect_attempts += 1;

            match state.refusal {
                Refusal::None => {}
                Refusal::Next(0) => state.refusal = Refusal::None,
                Refusal::Next(remaining) => {
                    state.refusal = if remaining > 1 {
                        Refusal::Next(remaining - 1)
                    } else {
                        Refusal::None
                    };
                    return Err(BrokerError::ConnectionRefused {
                        endpoint: endpoint.to_string(),
                    });
                }
                Refusal::Always => {
                    return Err(BrokerError::ConnectionRefused {
                        endpoint: endpoint.to_string(),
                    })
                }
            }

            if let Some((username, password)) = &state.credentials {
                let credentials = endpoint.credentials();
                if credentials.username() != username.as_str()
                    || credentials.password() != password.as_str()
                {
                    return Err(BrokerError::AuthenticationFailed {
                        username: credentials.username().to_string(),
                    });
                }
            }

            let connection = state.next_id();
            state.live_connections.insert(connection);
            state.journal.push(BrokerEvent::Connected { connection });
            Ok(connection)
        })?;

        debug!(connection, endpoint = %endpoint, "In-memory broker accepted connection");

        Ok(Box::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            connection,
        }))
    }

    fn transport_name(&self) -> &'static str {
        "in-memory"
    }
}

// ============================================================================
// Session and Links
// ============================================================================

struct InMemorySession {
    inner: Arc<BrokerInner>,
    connection: u64,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_queue(&self, config: &QueueConfiguration) -> Result<(), BrokerError> {
        self.inner.update(|state| {
            state.begin(self.connection, Some(BrokerOperation::Declare))?;
            state.declare_queue(config)
        })
    }

    async fn create_producer(
        &self,
        address: &AddressName,
        routing_type: RoutingType,
    ) -> Result<Box<dyn ProducerLink>, BrokerError> {
        self.inner
            .with_state(|state| state.begin(self.connection, None))?;

        Ok(Box::new(InMemoryProducerLink {
            inner: Arc::clone(&self.inner),
            connection: self.connection,
            address: address.clone(),
            routing_type,
        }))
    }

    async fn create_consumer(
        &self,
        _address: &AddressName,
        queue: &QueueName,
    ) -> Result<Box<dyn ConsumerLink>, BrokerError> {
        let consumer = self.inner.update(|state| {
            state.begin(self.connection, None)?;
            state.attach_consumer(self.connection, queue)
        })?;

        Ok(Box::new(InMemoryConsumerLink {
            inner: Arc::clone(&self.inner),
            connection: self.connection,
            consumer,
            queue: queue.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let deletions = self.inner.update(|state| {
            state.stats.session_closes += 1;
            state.drop_connection(self.connection)
        });
        schedule_deletions(&self.inner, deletions);
        Ok(())
    }
}

struct InMemoryProducerLink {
    inner: Arc<BrokerInner>,
    connection: u64,
    address: AddressName,
    routing_type: RoutingType,
}

#[async_trait]
impl ProducerLink for InMemoryProducerLink {
    async fn send(&mut self, message: &Message) -> Result<(), BrokerError> {
        let copies = self.inner.update(|state| {
            state.begin(self.connection, Some(BrokerOperation::Send))?;
            Ok::<_, BrokerError>(state.route(&self.address, self.routing_type, message))
        })?;

        trace!(address = %self.address, copies, "Message routed");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct InMemoryConsumerLink {
    inner: Arc<BrokerInner>,
    connection: u64,
    consumer: u64,
    queue: QueueName,
}

impl InMemoryConsumerLink {
    fn try_take(&self, state: &mut BrokerState) -> Result<Option<ReceivedMessage>, BrokerError> {
        if !state.live_connections.contains(&self.connection) {
            return Err(BrokerError::ConnectionLost {
                message: format!("connection {} was dropped by the broker", self.connection),
            });
        }

        let tag = DeliveryTag::new(state.next_id + 1);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: self.queue.to_string(),
            })?;

        let mut stored = match queue.messages.pop_front() {
            Some(stored) => stored,
            None => return Ok(None),
        };
        stored.delivery_count += 1;

        let received = ReceivedMessage {
            message: stored.message.clone(),
            tag,
            delivery_count: stored.delivery_count,
            received_at: Timestamp::now(),
        };
        queue.in_flight.insert(
            tag,
            InFlight {
                consumer: self.consumer,
                stored,
            },
        );

        state.next_id += 1;
        state.journal.push(BrokerEvent::Delivered {
            queue: self.queue.clone(),
            tag,
        });

        Ok(Some(received))
    }
}

#[async_trait]
impl ConsumerLink for InMemoryConsumerLink {
    async fn receive(&mut self) -> Result<ReceivedMessage, BrokerError> {
        self.inner.with_state(|state| {
            state.begin(self.connection, Some(BrokerOperation::Receive))
        })?;

        loop {
            // Registered before the state check so no wake-up is missed
            let changed = self.inner.changed.notified();

            if let Some(received) = self.inner.with_state(|state| self.try_take(state))? {
                trace!(queue = %self.queue, tag = %received.tag, "Message delivered");
                return Ok(received);
            }

            changed.await;
        }
    }

    async fn accept(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.update(|state| {
            state.begin(self.connection, Some(BrokerOperation::Accept))?;

            let queue = state
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| BrokerError::QueueNotFound {
                    queue: self.queue.to_string(),
                })?;

            match queue.in_flight.get(&tag) {
                Some(in_flight) if in_flight.consumer == self.consumer => {}
                _ => {
                    return Err(BrokerError::DeliveryNotFound {
                        tag: tag.to_string(),
                    })
                }
            }

            let body = queue
                .in_flight
                .remove(&tag)
                .map(|in_flight| in_flight.stored.message.body)
                .unwrap_or_default();

            state.stats.accepted += 1;
            state.journal.push(BrokerEvent::Accepted {
                queue: self.queue.clone(),
                tag,
                body,
            });
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let deletions = self
            .inner
            .update(|state| state.detach_consumer(self.consumer));
        schedule_deletions(&self.inner, deletions.into_iter().collect());
        Ok(())
    }
}

impl Drop for InMemoryConsumerLink {
    fn drop(&mut self) {
        let deletions = self
            .inner
            .update(|state| state.detach_consumer(self.consumer));
        schedule_deletions(&self.inner, deletions.into_iter().collect());
    }
}
