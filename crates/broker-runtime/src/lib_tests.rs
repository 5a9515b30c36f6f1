//! Tests for the broker-runtime library module.

use super::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Verify that the public surface wires together from the crate root.
#[tokio::test]
async fn test_crate_root_exports_compose() {
    let broker = InMemoryBroker::new();
    let cancel = CancellationToken::new();
    let endpoint = Endpoint::new("localhost", DEFAULT_AMQP_PORT, "guest", "guest").unwrap();

    let connection = ConnectionFactory::new(Arc::new(broker.clone()))
        .with_recovery_policy(RecoveryPolicy::constant_backoff(Duration::from_millis(10), 1))
        .connect(endpoint, &cancel)
        .await
        .unwrap();

    let address = AddressName::new("MyAddress").unwrap();
    let consumer = subscribe(&connection, address.clone(), &cancel)
        .await
        .unwrap();

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(broker.bound_queues(&address), vec![consumer.queue().clone()]);

    drop(consumer);
    connection.close().await.unwrap();
}

#[test]
fn test_default_recovery_policy() {
    let policy = RecoveryPolicy::default();

    assert_eq!(policy.interval, Duration::from_secs(5));
    assert_eq!(policy.retry_count, 5);
}

#[test]
fn test_subscription_defaults() {
    let config = QueueConfiguration::subscription(
        AddressName::new("MyAddress").unwrap(),
        QueueName::unique(),
    );

    assert_eq!(config.routing_type, RoutingType::Multicast);
    assert!(config.exclusive);
    assert!(config.durable);
    assert!(config.auto_create_address);
    assert!(config.auto_delete);
    assert_eq!(config.auto_delete_message_count, -1);
    assert_eq!(config.auto_delete_delay, Duration::from_secs(30));
}
