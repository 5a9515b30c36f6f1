//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(BrokerError::ConnectionLost {
        message: "socket closed".to_string(),
    }
    .is_transient());

    assert!(BrokerError::ReceiveFailed {
        queue: "q".to_string(),
        message: "link error".to_string(),
    }
    .is_transient());

    assert!(!BrokerError::QueueAlreadyExists {
        queue: "q".to_string(),
    }
    .is_transient());

    assert!(!BrokerError::RecoveryExhausted { attempts: 5 }.is_transient());
    assert!(!BrokerError::Cancelled.is_transient());
}

#[test]
fn test_terminal_errors() {
    assert!(BrokerError::Cancelled.is_terminal());
    assert!(BrokerError::RecoveryExhausted { attempts: 3 }.is_terminal());
    assert!(BrokerError::ConnectionClosed.is_terminal());

    // Transient broker errors are handled by the loop that saw them
    assert!(!BrokerError::SendFailed {
        address: "MyAddress".to_string(),
        message: "rejected".to_string(),
    }
    .is_terminal());
    assert!(!BrokerError::ConnectionLost {
        message: "reset".to_string(),
    }
    .is_terminal());
}

#[test]
fn test_cancellation_is_not_reported_as_failure() {
    assert!(BrokerError::Cancelled.is_cancellation());
    assert!(!BrokerError::RecoveryExhausted { attempts: 1 }.is_cancellation());
}

#[test]
fn test_decode_error_converts_into_broker_error() {
    let invalid: Vec<u8> = vec![0xff, 0xfe];
    let utf8_error = std::str::from_utf8(&invalid).unwrap_err();

    let error: BrokerError = DecodeError::from(utf8_error).into();

    assert!(matches!(error, BrokerError::Decode(DecodeError::InvalidUtf8(_))));
    assert!(!error.is_transient());
}

#[test]
fn test_connect_failed_message_includes_attempts() {
    let error = BrokerError::ConnectFailed {
        endpoint: "amqp://localhost:5672".to_string(),
        attempts: 6,
        message: "refused".to_string(),
    };

    let text = error.to_string();
    assert!(text.contains("amqp://localhost:5672"));
    assert!(text.contains("6 attempt(s)"));
}
