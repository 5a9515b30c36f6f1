//! Tests for the producer loop.

use super::*;
use crate::connection::{Connection, Consumer};
use crate::endpoint::Endpoint;
use crate::error::BrokerError;
use crate::message::{AddressName, QueueName};
use crate::providers::memory::{BrokerOperation, InMemoryBroker};
use crate::recovery::RecoveryPolicy;
use crate::topology::{QueueConfiguration, RoutingType};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Sent(u64),
    SendFailed(u64),
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<(Event, Instant)>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| *event)
            .collect()
    }

    fn time_of(&self, wanted: Event) -> Option<Instant> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(event, _)| *event == wanted)
            .map(|(_, at)| *at)
    }
}

impl LoopObserver for RecordingObserver {
    fn message_sent(&self, counter: u64) {
        self.events
            .lock()
            .unwrap()
            .push((Event::Sent(counter), Instant::now()));
    }

    fn send_failed(&self, counter: u64, _error: &BrokerError) {
        self.events
            .lock()
            .unwrap()
            .push((Event::SendFailed(counter), Instant::now()));
    }
}

fn address() -> AddressName {
    AddressName::new("MyAddress").unwrap()
}

async fn setup(
    broker: &InMemoryBroker,
    policy: RecoveryPolicy,
    cancel: &CancellationToken,
) -> (Connection, Consumer, Producer) {
    let endpoint = Endpoint::new("localhost", 5672, "guest", "guest").unwrap();
    let connection = Connection::connect(Arc::new(broker.clone()), endpoint, policy, cancel)
        .await
        .unwrap();

    let mut config = QueueConfiguration::subscription(address(), QueueName::unique());
    config.auto_delete = false;
    connection
        .topology_manager()
        .declare_queue(&config, cancel)
        .await
        .unwrap();
    let consumer = connection
        .create_consumer(config.address, config.name, cancel)
        .await
        .unwrap();
    let producer = connection
        .create_producer(address(), RoutingType::Multicast, cancel)
        .await
        .unwrap();

    (connection, consumer, producer)
}

async fn drain(consumer: &mut Consumer, count: usize, cancel: &CancellationToken) -> Vec<String> {
    let mut bodies = Vec::new();
    for _ in 0..count {
        let delivery = consumer.receive(cancel).await.unwrap();
        let message = consumer.accept(delivery).await.unwrap();
        bodies.push(message.body_as_str().unwrap().to_string());
    }
    bodies
}

/// Verify that message n carries counter n when no send fails.
#[tokio::test(start_paused = true)]
async fn test_counter_matches_message_index() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, mut consumer, producer) =
        setup(&broker, RecoveryPolicy::default(), &cancel).await;

    let task = tokio::spawn(ProducerLoop::new(producer, cancel.clone()).run());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    cancel.cancel();
    let summary = task.await.unwrap();

    assert_eq!(summary.sent, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.next_counter, 5);

    let drain_cancel = CancellationToken::new();
    let bodies = drain(&mut consumer, 4, &drain_cancel).await;
    assert_eq!(bodies, vec!["1", "2", "3", "4"]);
}

/// Verify that sends are paced by the configured interval.
#[tokio::test(start_paused = true)]
async fn test_sends_are_paced() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, _consumer, producer) =
        setup(&broker, RecoveryPolicy::default(), &cancel).await;
    let observer = Arc::new(RecordingObserver::default());

    let task = tokio::spawn(
        ProducerLoop::new(producer, cancel.clone())
            .with_interval(Duration::from_millis(250))
            .with_observer(observer.clone())
            .run(),
    );
    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    task.await.unwrap();

    let first = observer.time_of(Event::Sent(1)).unwrap();
    let second = observer.time_of(Event::Sent(2)).unwrap();
    assert_eq!(second - first, Duration::from_millis(250));
    assert_eq!(
        observer.events(),
        vec![Event::Sent(1), Event::Sent(2), Event::Sent(3)]
    );
}

/// Verify that a failed send is retried with the same counter and no pacing wait.
#[tokio::test(start_paused = true)]
async fn test_failed_send_retried_with_same_counter() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, mut consumer, producer) =
        setup(&broker, RecoveryPolicy::default(), &cancel).await;
    let observer = Arc::new(RecordingObserver::default());
    broker.fail_next(
        BrokerOperation::Send,
        BrokerError::SendFailed {
            address: "MyAddress".to_string(),
            message: "injected".to_string(),
        },
    );

    let task = tokio::spawn(
        ProducerLoop::new(producer, cancel.clone())
            .with_observer(observer.clone())
            .run(),
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    let summary = task.await.unwrap();

    assert_eq!(
        observer.events(),
        vec![Event::SendFailed(1), Event::Sent(1), Event::Sent(2)]
    );
    assert_eq!(
        observer.time_of(Event::SendFailed(1)),
        observer.time_of(Event::Sent(1))
    );
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.sent, 2);

    let drain_cancel = CancellationToken::new();
    assert_eq!(drain(&mut consumer, 2, &drain_cancel).await, vec!["1", "2"]);
}

/// Verify that cancellation during the pacing wait ends the loop without
/// rolling the counter back.
#[tokio::test(start_paused = true)]
async fn test_cancel_during_pacing() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, _consumer, producer) =
        setup(&broker, RecoveryPolicy::default(), &cancel).await;
    let started = Instant::now();

    let task = tokio::spawn(
        ProducerLoop::new(producer, cancel.clone())
            .with_interval(Duration::from_secs(60))
            .run(),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    let summary = task.await.unwrap();

    assert_eq!(summary.sent, 1);
    assert_eq!(summary.next_counter, 2);
    assert!(started.elapsed() < Duration::from_secs(60));
}

/// Verify that a cancelled loop never sends.
#[tokio::test]
async fn test_cancelled_before_start_sends_nothing() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, _consumer, producer) =
        setup(&broker, RecoveryPolicy::default(), &cancel).await;
    let before = broker.stats().operations;

    cancel.cancel();
    let summary = ProducerLoop::new(producer, cancel.clone()).run().await;

    assert_eq!(summary, ProducerSummary {
        sent: 0,
        failed: 0,
        next_counter: 1,
    });
    assert_eq!(broker.stats().operations, before);
}

/// Verify that the loop stops once connection recovery is exhausted.
#[tokio::test(start_paused = true)]
async fn test_stops_on_recovery_exhaustion() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let (_connection, _consumer, producer) = setup(&broker, RecoveryPolicy::none(), &cancel).await;

    broker.drop_connections();
    let summary = ProducerLoop::new(producer, cancel.clone()).run().await;

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.next_counter, 1);
    assert!(!cancel.is_cancelled());
}

/// Verify that a zero-length pause still observes cancellation.
#[tokio::test]
async fn test_pause_zero_observes_cancel() {
    let cancel = CancellationToken::new();
    assert!(pause(Duration::ZERO, &cancel).await);

    cancel.cancel();
    assert!(!pause(Duration::ZERO, &cancel).await);
    assert!(!pause(Duration::from_secs(5), &cancel).await);
}
