//! Common test utilities for broker-runtime integration tests
//!
//! This module provides:
//! - A recording observer that captures loop reports with their timestamps
//! - Helpers that connect to an in-memory broker and start both loops
//! - Shared fixtures for addresses and recovery policies

use broker_runtime::{
    subscribe, BrokerError, BrokerEvent, Connection, ConsumerLoop, ConsumerSummary,
    InMemoryBroker, LoopObserver, ProducerLoop, ProducerSummary, ReceivedMessage, RecoveryPolicy,
    RoutingType,
};
use broker_runtime::{AddressName, Endpoint};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Recording Observer
// ============================================================================

/// A single loop report
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Report {
    Sent(u64),
    SendFailed(u64),
    Received {
        body: String,
        /// Whether the broker had settled the delivery when it was reported
        acknowledged: bool,
    },
    ReceiveFailed(String),
}

/// Observer that records every report with the (paused) clock time
#[derive(Clone)]
pub struct RecordingObserver {
    broker: InMemoryBroker,
    reports: Arc<Mutex<Vec<(Report, Instant)>>>,
}

impl RecordingObserver {
    pub fn new(broker: &InMemoryBroker) -> Arc<Self> {
        Arc::new(Self {
            broker: broker.clone(),
            reports: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(report, _)| report.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn timed_reports(&self) -> Vec<(Report, Instant)> {
        self.reports.lock().unwrap().clone()
    }

    /// Bodies of received messages, in report order
    #[allow(dead_code)]
    pub fn received_bodies(&self) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter_map(|report| match report {
                Report::Received { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    /// Counters of successful sends, in report order
    #[allow(dead_code)]
    pub fn sent_counters(&self) -> Vec<u64> {
        self.reports()
            .into_iter()
            .filter_map(|report| match report {
                Report::Sent(counter) => Some(counter),
                _ => None,
            })
            .collect()
    }

    fn record(&self, report: Report) {
        self.reports.lock().unwrap().push((report, Instant::now()));
    }
}

impl LoopObserver for RecordingObserver {
    fn message_sent(&self, counter: u64) {
        self.record(Report::Sent(counter));
    }

    fn send_failed(&self, counter: u64, _error: &BrokerError) {
        self.record(Report::SendFailed(counter));
    }

    fn message_received(&self, message: &ReceivedMessage) {
        let acknowledged = self.broker.journal().iter().any(|event| {
            matches!(event, BrokerEvent::Accepted { tag, .. } if *tag == message.tag)
        });
        self.record(Report::Received {
            body: message.body_as_str().unwrap().to_string(),
            acknowledged,
        });
    }

    fn receive_failed(&self, error: &BrokerError) {
        self.record(Report::ReceiveFailed(error.to_string()));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn address() -> AddressName {
    AddressName::new("MyAddress").unwrap()
}

pub fn endpoint() -> Endpoint {
    Endpoint::new("localhost", 5672, "guest", "guest").unwrap()
}

/// Short constant backoff so recovery scenarios finish quickly on the paused clock
#[allow(dead_code)]
pub fn fast_recovery(retry_count: u32) -> RecoveryPolicy {
    RecoveryPolicy::constant_backoff(Duration::from_secs(1), retry_count)
}

pub async fn connect(
    broker: &InMemoryBroker,
    policy: RecoveryPolicy,
    cancel: &CancellationToken,
) -> Connection {
    Connection::connect(Arc::new(broker.clone()), endpoint(), policy, cancel)
        .await
        .unwrap()
}

// ============================================================================
// Loop Helpers
// ============================================================================

/// Subscribe on `connection` and spawn a consumer loop reporting to `observer`
pub async fn spawn_consumer(
    connection: &Connection,
    observer: Arc<RecordingObserver>,
    cancel: &CancellationToken,
) -> JoinHandle<ConsumerSummary> {
    let consumer = subscribe(connection, address(), cancel).await.unwrap();
    tokio::spawn(
        ConsumerLoop::new(consumer, cancel.clone())
            .with_observer(observer)
            .run(),
    )
}

/// Attach a multicast producer on `connection` and spawn a paced producer loop
pub async fn spawn_producer(
    connection: &Connection,
    interval: Duration,
    observer: Arc<RecordingObserver>,
    cancel: &CancellationToken,
) -> JoinHandle<ProducerSummary> {
    let producer = connection
        .create_producer(address(), RoutingType::Multicast, cancel)
        .await
        .unwrap();
    tokio::spawn(
        ProducerLoop::new(producer, cancel.clone())
            .with_interval(interval)
            .with_observer(observer)
            .run(),
    )
}

/// Let spawned loops run until they block
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
