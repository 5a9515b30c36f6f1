//! Reporting hooks for the producer and consumer loops.
//!
//! Loops report progress through a [`LoopObserver`]. The default
//! [`TracingObserver`] writes one structured log line per event; binaries can
//! supply their own observer (for example one that prints to stdout) and tests
//! use recording observers to assert on ordering.

use crate::error::BrokerError;
use crate::message::ReceivedMessage;
use tracing::{debug, info, warn};

/// Receives loop events. Every method has a no-op default.
pub trait LoopObserver: Send + Sync {
    /// Message `counter` was sent and accepted by the broker
    fn message_sent(&self, _counter: u64) {}

    /// Sending message `counter` failed; the loop retries the same counter
    fn send_failed(&self, _counter: u64, _error: &BrokerError) {}

    /// A message was received and acknowledged
    fn message_received(&self, _message: &ReceivedMessage) {}

    /// A receive or acknowledge failed; the loop continues with the next cycle
    fn receive_failed(&self, _error: &BrokerError) {}
}

/// Reports loop events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LoopObserver for TracingObserver {
    fn message_sent(&self, counter: u64) {
        info!(counter, "Message sent: {}", counter);
    }

    fn send_failed(&self, counter: u64, error: &BrokerError) {
        debug!(counter, error = %error, "Send failed");
    }

    fn message_received(&self, message: &ReceivedMessage) {
        match message.body_as_str() {
            Ok(text) => info!(
                tag = %message.tag,
                delivery_count = message.delivery_count,
                "Received message: {}",
                text
            ),
            Err(e) => warn!(
                tag = %message.tag,
                error = %e,
                bytes = message.message.body.len(),
                "Received message with undecodable body"
            ),
        }
    }

    fn receive_failed(&self, error: &BrokerError) {
        warn!(error = %error, "Receive failed");
    }
}
