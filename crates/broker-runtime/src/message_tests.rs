//! Tests for message types and routing identifiers.

use super::*;

#[test]
fn test_address_name_validation() {
    assert!(AddressName::new("MyAddress").is_ok());
    assert!(AddressName::new("orders.created").is_ok());

    assert!(AddressName::new("").is_err());
    assert!(AddressName::new("with space").is_err());
    assert!(AddressName::new("tab\tchar").is_err());
    assert!(AddressName::new("address::queue").is_err());
    assert!(AddressName::new("a".repeat(256)).is_err());
}

#[test]
fn test_queue_name_validation() {
    assert!(QueueName::new("subscription-1").is_ok());

    match QueueName::new("") {
        Err(ValidationError::Required { field }) => assert_eq!(field, "queue_name"),
        other => panic!("Expected Required error, got: {:?}", other),
    }
    assert!(QueueName::new("bad\nname").is_err());
}

#[test]
fn test_unique_queue_names_never_repeat() {
    let first = QueueName::unique();
    let second = QueueName::unique();

    assert_ne!(first, second);
    // Generated names must pass the same validation as configured ones
    assert!(QueueName::new(first.as_str()).is_ok());
}

#[test]
fn test_fully_qualified_queue_name() {
    let address = AddressName::new("MyAddress").unwrap();
    let queue = QueueName::new("q1").unwrap();

    assert_eq!(queue.qualified(&address), "MyAddress::q1");
}

#[test]
fn test_text_message_body() {
    let message = Message::text("42").with_property("source", "producer");

    assert_eq!(message.body_as_str().unwrap(), "42");
    assert_eq!(message.properties.get("source").map(String::as_str), Some("producer"));
}

#[test]
fn test_non_utf8_body_fails_to_decode() {
    let message = Message::new(Bytes::from_static(&[0xc3, 0x28]));

    assert!(matches!(
        message.body_as_str(),
        Err(DecodeError::InvalidUtf8(_))
    ));
}

#[test]
fn test_message_ids_are_unique() {
    let first = Message::text("a");
    let second = Message::text("a");

    assert_ne!(first.message_id, second.message_id);
    assert!(!first.message_id.as_str().is_empty());
}

#[test]
fn test_delivery_handle_exposes_received_message() {
    let received = ReceivedMessage {
        message: Message::text("7"),
        tag: DeliveryTag::new(3),
        delivery_count: 1,
        received_at: Timestamp::now(),
    };

    let handle = DeliveryHandle::new(received, 2);

    assert_eq!(handle.tag(), DeliveryTag::new(3));
    assert_eq!(handle.link_generation(), 2);
    assert_eq!(handle.message().body_as_str().unwrap(), "7");
    assert_eq!(handle.into_message().delivery_count, 1);
}
