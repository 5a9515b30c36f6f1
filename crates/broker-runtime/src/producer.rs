//! # Producer Loop Module
//!
//! Sends a numbered message stream to one address at a fixed pace.
//!
//! Each iteration sends the decimal counter value as a text body, reports
//! success, increments the counter and waits for the pacing interval. A failed
//! send is reported and retried with the same counter value without pacing,
//! so with zero send failures message `n` always carries the value `n`.

use crate::connection::Producer;
use crate::message::Message;
use crate::observer::{LoopObserver, TracingObserver};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Outcome of a finished producer loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    /// Messages accepted by the broker
    pub sent: u64,

    /// Send attempts that failed and were retried
    pub failed: u64,

    /// Counter value the next message would have carried
    pub next_counter: u64,
}

/// Paced, counter-driven send loop
///
/// # Example
///
/// ```rust,ignore
/// let producer = connection
///     .create_producer(address, RoutingType::Multicast, &cancel)
///     .await?;
///
/// let summary = ProducerLoop::new(producer, cancel.clone())
///     .with_interval(Duration::from_secs(1))
///     .run()
///     .await;
///
/// info!(sent = summary.sent, "Producer finished");
/// ```
pub struct ProducerLoop {
    producer: Producer,
    cancel: CancellationToken,
    interval: Duration,
    error_delay: Duration,
    observer: Arc<dyn LoopObserver>,
}

impl ProducerLoop {
    /// Pacing interval between successful sends
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// First counter value sent
    pub const FIRST_COUNTER: u64 = 1;

    pub fn new(producer: Producer, cancel: CancellationToken) -> Self {
        Self {
            producer,
            cancel,
            interval: Self::DEFAULT_INTERVAL,
            error_delay: Duration::ZERO,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wait after a failed send before retrying; zero retries immediately
    pub fn with_error_delay(mut self, error_delay: Duration) -> Self {
        self.error_delay = error_delay;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run until cancelled or the connection becomes unusable
    pub async fn run(mut self) -> ProducerSummary {
        let mut summary = ProducerSummary {
            next_counter: Self::FIRST_COUNTER,
            ..ProducerSummary::default()
        };

        info!(
            address = %self.producer.address(),
            interval_ms = self.interval.as_millis() as u64,
            "Producer loop started"
        );

        while !self.cancel.is_cancelled() {
            let counter = summary.next_counter;
            let message = Message::text(counter.to_string());

            match self.producer.send(&message, &self.cancel).await {
                Ok(()) => {
                    self.observer.message_sent(counter);
                    summary.sent += 1;
                    summary.next_counter += 1;

                    if !pause(self.interval, &self.cancel).await {
                        break;
                    }
                }
                Err(e) if e.is_terminal() => {
                    if !e.is_cancellation() {
                        warn!(counter, error = %e, "Producer loop stopping");
                    }
                    break;
                }
                Err(e) => {
                    debug!(counter, error = %e, "Send failed; retrying with the same counter");
                    summary.failed += 1;
                    self.observer.send_failed(counter, &e);

                    if !pause(self.error_delay, &self.cancel).await {
                        break;
                    }
                }
            }
        }

        info!(
            sent = summary.sent,
            failed = summary.failed,
            next_counter = summary.next_counter,
            "Producer loop stopped"
        );

        summary
    }
}

/// Cancellable wait. Returns `false` when cancelled.
///
/// A zero duration still yields to the scheduler once.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return !cancel.is_cancelled();
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
