//! Address and queue provisioning.

use crate::connection::Connection;
use crate::error::BrokerError;
use crate::message::{AddressName, QueueName};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an address distributes messages to its queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutingType {
    /// Each message goes to exactly one bound queue
    Anycast,
    /// Every bound queue receives its own copy of each message
    Multicast,
}

impl RoutingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anycast => "ANYCAST",
            Self::Multicast => "MULTICAST",
        }
    }
}

impl std::fmt::Display for RoutingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfiguration {
    pub address: AddressName,
    pub name: QueueName,
    pub routing_type: RoutingType,
    pub auto_create_address: bool,
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    /// Message-count threshold for auto-delete; `-1` disables the check
    pub auto_delete_message_count: i64,
    pub auto_delete_delay: Duration,
}

impl QueueConfiguration {
    /// Sentinel disabling the auto-delete message-count threshold
    pub const AUTO_DELETE_MESSAGE_COUNT_DISABLED: i64 = -1;

    pub const DEFAULT_AUTO_DELETE_DELAY: Duration = Duration::from_secs(30);

    /// Exclusive, self-cleaning multicast subscription queue bound to `address`.
    ///
    /// `name` must be unique per consumer run, see [`QueueName::unique`].
    pub fn subscription(address: AddressName, name: QueueName) -> Self {
        Self {
            address,
            name,
            routing_type: RoutingType::Multicast,
            auto_create_address: true,
            exclusive: true,
            durable: true,
            auto_delete: true,
            auto_delete_message_count: Self::AUTO_DELETE_MESSAGE_COUNT_DISABLED,
            auto_delete_delay: Self::DEFAULT_AUTO_DELETE_DELAY,
        }
    }

    /// Whether a queue holding `message_count` messages may be auto-deleted
    pub fn allows_auto_delete_with(&self, message_count: usize) -> bool {
        if !self.auto_delete {
            return false;
        }

        self.auto_delete_message_count == Self::AUTO_DELETE_MESSAGE_COUNT_DISABLED
            || (self.auto_delete_message_count >= 0
                && message_count as i64 <= self.auto_delete_message_count)
    }
}

/// Declares addresses and queues on an established connection
pub struct TopologyManager<'a> {
    connection: &'a Connection,
}

impl<'a> TopologyManager<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Declare the address (when auto-create is set) and bind the queue.
    ///
    /// Not idempotent: declaring an existing queue name is rejected by the
    /// broker with [`BrokerError::QueueAlreadyExists`].
    pub async fn declare_queue(
        &self,
        config: &QueueConfiguration,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let active = self.connection.active_session(cancel).await?;

        debug!(
            address = %config.address,
            queue = %config.name,
            routing_type = %config.routing_type,
            "Declaring queue"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            result = active.session.declare_queue(config) => result,
        };

        match result {
            Ok(()) => {
                info!(
                    address = %config.address,
                    queue = %config.name,
                    routing_type = %config.routing_type,
                    exclusive = config.exclusive,
                    durable = config.durable,
                    auto_delete = config.auto_delete,
                    auto_delete_delay_ms = config.auto_delete_delay.as_millis() as u64,
                    "Queue declared"
                );
                Ok(())
            }
            Err(BrokerError::ConnectionLost { message }) => {
                self.connection
                    .connection_lost(active.generation, &message);
                Err(BrokerError::ProvisionFailed {
                    queue: config.name.to_string(),
                    message,
                })
            }
            Err(e) => {
                if !e.is_cancellation() {
                    warn!(queue = %config.name, error = %e, "Queue declaration failed");
                }
                Err(e)
            }
        }
    }
}

/// Declare `config` on `connection`; see [`TopologyManager::declare_queue`]
pub async fn declare_queue(
    connection: &Connection,
    config: &QueueConfiguration,
    cancel: &CancellationToken,
) -> Result<(), BrokerError> {
    TopologyManager::new(connection)
        .declare_queue(config, cancel)
        .await
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
