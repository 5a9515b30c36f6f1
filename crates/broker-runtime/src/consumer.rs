//! # Consumer Loop Module
//!
//! Receives from a subscription queue, acknowledges each message and then
//! reports it.
//!
//! The loop cycles `Idle -> Receiving -> Acknowledging -> Idle`. A transient
//! broker error moves it to `Degraded`, from which it goes straight back to
//! `Receiving`. Cancellation, recovery exhaustion and a closed connection
//! end it in `Cancelled`.
//!
//! Acknowledgment always happens before the message is reported, so a crash
//! between the two loses the report without a broker-side redelivery.

use crate::connection::{Connection, Consumer};
use crate::error::BrokerError;
use crate::message::{AddressName, QueueName};
use crate::observer::{LoopObserver, TracingObserver};
use crate::producer::pause;
use crate::topology::{QueueConfiguration, TopologyManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Consumer loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerLoopState {
    Idle,
    Receiving,
    Acknowledging,
    /// Last operation failed; the next cycle starts immediately
    Degraded,
    Cancelled,
}

/// Outcome of a finished consumer loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSummary {
    /// Messages received and acknowledged
    pub received: u64,

    /// Receive and acknowledge failures
    pub errors: u64,
}

/// Declare a fresh exclusive subscription queue on `address` and attach a
/// consumer to it.
///
/// The queue name is a new UUID on every call, so restarts never collide with
/// a queue left behind by a previous run.
pub async fn subscribe(
    connection: &Connection,
    address: AddressName,
    cancel: &CancellationToken,
) -> Result<Consumer, BrokerError> {
    let config = QueueConfiguration::subscription(address, QueueName::unique());

    TopologyManager::new(connection)
        .declare_queue(&config, cancel)
        .await?;

    connection
        .create_consumer(config.address, config.name, cancel)
        .await
}

/// Receive, acknowledge and report loop
///
/// # Example
///
/// ```rust,ignore
/// let consumer = subscribe(&connection, address, &cancel).await?;
///
/// let summary = ConsumerLoop::new(consumer, cancel.clone()).run().await;
/// info!(received = summary.received, "Consumer finished");
/// ```
pub struct ConsumerLoop {
    consumer: Consumer,
    cancel: CancellationToken,
    error_delay: Duration,
    observer: Arc<dyn LoopObserver>,
    state: ConsumerLoopState,
}

impl ConsumerLoop {
    pub fn new(consumer: Consumer, cancel: CancellationToken) -> Self {
        Self {
            consumer,
            cancel,
            error_delay: Duration::ZERO,
            observer: Arc::new(TracingObserver),
            state: ConsumerLoopState::Idle,
        }
    }

    /// Wait after a failed cycle before receiving again; zero retries immediately
    pub fn with_error_delay(mut self, error_delay: Duration) -> Self {
        self.error_delay = error_delay;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> ConsumerLoopState {
        self.state
    }

    /// Run until cancelled or the connection becomes unusable
    pub async fn run(mut self) -> ConsumerSummary {
        let mut summary = ConsumerSummary::default();

        info!(
            address = %self.consumer.address(),
            queue = %self.consumer.queue(),
            "Consumer loop started"
        );

        while !self.cancel.is_cancelled() {
            self.transition(ConsumerLoopState::Receiving);

            let delivery = match self.consumer.receive(&self.cancel).await {
                Ok(delivery) => delivery,
                Err(e) if e.is_terminal() => {
                    self.stopping(&e);
                    break;
                }
                Err(e) => {
                    if !self.degrade(&e, &mut summary).await {
                        break;
                    }
                    continue;
                }
            };

            self.transition(ConsumerLoopState::Acknowledging);

            match self.consumer.accept(delivery).await {
                Ok(message) => {
                    summary.received += 1;
                    self.observer.message_received(&message);
                    self.transition(ConsumerLoopState::Idle);
                }
                Err(e) if e.is_terminal() => {
                    self.stopping(&e);
                    break;
                }
                Err(e) => {
                    if !self.degrade(&e, &mut summary).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConsumerLoopState::Cancelled);
        info!(
            queue = %self.consumer.queue(),
            received = summary.received,
            errors = summary.errors,
            "Consumer loop stopped"
        );

        summary
    }

    fn transition(&mut self, next: ConsumerLoopState) {
        trace!(from = ?self.state, to = ?next, "Consumer loop transition");
        self.state = next;
    }

    fn stopping(&self, error: &BrokerError) {
        if !error.is_cancellation() {
            warn!(queue = %self.consumer.queue(), error = %error, "Consumer loop stopping");
        }
    }

    /// Report `error` and wait out the error delay. Returns `false` when
    /// cancelled while waiting.
    async fn degrade(&mut self, error: &BrokerError, summary: &mut ConsumerSummary) -> bool {
        self.transition(ConsumerLoopState::Degraded);
        summary.errors += 1;
        self.observer.receive_failed(error);
        pause(self.error_delay, &self.cancel).await
    }
}
