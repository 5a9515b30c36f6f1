//! Tests for address and queue provisioning.

use super::*;
use crate::endpoint::Endpoint;
use crate::providers::memory::{BrokerOperation, InMemoryBroker};
use crate::recovery::RecoveryPolicy;
use std::sync::Arc;

fn address() -> AddressName {
    AddressName::new("MyAddress").unwrap()
}

async fn connect(broker: &InMemoryBroker, cancel: &CancellationToken) -> Connection {
    let endpoint = Endpoint::new("localhost", 5672, "guest", "guest").unwrap();
    Connection::connect(
        Arc::new(broker.clone()),
        endpoint,
        RecoveryPolicy::constant_backoff(Duration::from_secs(1), 3),
        cancel,
    )
    .await
    .unwrap()
}

// ============================================================================
// Queue Configuration Tests
// ============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_routing_type_wire_names() {
        assert_eq!(RoutingType::Multicast.to_string(), "MULTICAST");
        assert_eq!(RoutingType::Anycast.as_str(), "ANYCAST");
        assert_eq!(
            serde_json::to_string(&RoutingType::Multicast).unwrap(),
            "\"MULTICAST\""
        );
    }

    /// Verify that a disabled message-count threshold allows auto-delete at any depth.
    #[test]
    fn test_auto_delete_threshold_disabled() {
        let config = QueueConfiguration::subscription(address(), QueueName::unique());

        assert!(config.allows_auto_delete_with(0));
        assert!(config.allows_auto_delete_with(10_000));
    }

    /// Verify that a message-count threshold caps the queue depth for auto-delete.
    #[test]
    fn test_auto_delete_threshold_enabled() {
        let mut config = QueueConfiguration::subscription(address(), QueueName::unique());
        config.auto_delete_message_count = 2;

        assert!(config.allows_auto_delete_with(2));
        assert!(!config.allows_auto_delete_with(3));
    }

    #[test]
    fn test_auto_delete_off() {
        let mut config = QueueConfiguration::subscription(address(), QueueName::unique());
        config.auto_delete = false;

        assert!(!config.allows_auto_delete_with(0));
    }
}

// ============================================================================
// Declaration Tests
// ============================================================================

mod declaration {
    use super::*;

    /// Verify that declaring a subscription binds a queue to the address.
    #[tokio::test]
    async fn test_declare_queue_binds_to_address() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let connection = connect(&broker, &cancel).await;
        let config = QueueConfiguration::subscription(address(), QueueName::unique());

        declare_queue(&connection, &config, &cancel).await.unwrap();

        assert!(broker.has_queue(&config.name));
        assert_eq!(broker.bound_queues(&address()), vec![config.name.clone()]);
    }

    /// Verify that reusing an exclusive queue name is rejected.
    #[tokio::test]
    async fn test_declare_existing_queue_rejected() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let connection = connect(&broker, &cancel).await;
        let config = QueueConfiguration::subscription(address(), QueueName::unique());
        let manager = connection.topology_manager();

        manager.declare_queue(&config, &cancel).await.unwrap();
        let result = manager.declare_queue(&config, &cancel).await;

        assert!(matches!(result, Err(BrokerError::QueueAlreadyExists { .. })));
    }

    /// Verify that a cancelled token prevents the declaration entirely.
    #[tokio::test]
    async fn test_declare_after_cancel_issues_no_operation() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let connection = connect(&broker, &cancel).await;
        let config = QueueConfiguration::subscription(address(), QueueName::unique());
        let before = broker.stats().operations;

        cancel.cancel();
        let result = declare_queue(&connection, &config, &cancel).await;

        assert!(matches!(result, Err(BrokerError::Cancelled)));
        assert_eq!(broker.stats().operations, before);
        assert!(!broker.has_queue(&config.name));
    }

    /// Verify that connection loss during declaration is a provisioning
    /// failure and starts recovery.
    #[tokio::test(start_paused = true)]
    async fn test_declare_connection_lost_starts_recovery() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let connection = connect(&broker, &cancel).await;
        let config = QueueConfiguration::subscription(address(), QueueName::unique());
        broker.fail_next(
            BrokerOperation::Declare,
            BrokerError::ConnectionLost {
                message: "link detached".to_string(),
            },
        );

        let result = declare_queue(&connection, &config, &cancel).await;

        assert!(matches!(result, Err(BrokerError::ProvisionFailed { .. })));
        assert_eq!(connection.state(), crate::ConnectionState::Reconnecting);

        // Suspends until the supervisor reconnects, then succeeds
        declare_queue(&connection, &config, &cancel).await.unwrap();

        assert_eq!(connection.state(), crate::ConnectionState::Connected);
        assert!(broker.has_queue(&config.name));
    }
}
