//! Error types for broker operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to connect to {endpoint} after {attempts} attempt(s): {message}")]
    ConnectFailed {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    #[error("Connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },

    #[error("Authentication failed for user '{username}'")]
    AuthenticationFailed { username: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Connection recovery exhausted after {attempts} attempt(s)")]
    RecoveryExhausted { attempts: u32 },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Failed to declare queue '{queue}': {message}")]
    ProvisionFailed { queue: String, message: String },

    #[error("Queue already exists: {queue}")]
    QueueAlreadyExists { queue: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Address not found: {address}")]
    AddressNotFound { address: String },

    #[error("Exclusive queue '{queue}' already has a consumer attached")]
    ExclusiveConsumerBound { queue: String },

    #[error("Send to '{address}' failed: {message}")]
    SendFailed { address: String, message: String },

    #[error("Receive from '{queue}' failed: {message}")]
    ReceiveFailed { queue: String, message: String },

    #[error("Acknowledge failed: {message}")]
    AcknowledgeFailed { message: String },

    #[error("Delivery not found or already settled: {tag}")]
    DeliveryNotFound { tag: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Message decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::ConnectFailed { .. } => false,
            Self::ConnectionRefused { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::ConnectionLost { .. } => true,
            Self::RecoveryExhausted { .. } => false,
            Self::ConnectionClosed => false,
            Self::ProvisionFailed { .. } => true,
            Self::QueueAlreadyExists { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::AddressNotFound { .. } => false,
            Self::ExclusiveConsumerBound { .. } => false,
            Self::SendFailed { .. } => true,
            Self::ReceiveFailed { .. } => true,
            Self::AcknowledgeFailed { .. } => true,
            Self::DeliveryNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::Decode(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if error ends every loop using the connection.
    ///
    /// Cancellation, recovery exhaustion and a closed connection are terminal;
    /// everything else is handled locally by the loop that observed it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::RecoveryExhausted { .. } | Self::ConnectionClosed
        )
    }

    /// Check if error represents cooperative cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors while decoding a message body
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The transport could not decode the delivery into a text body
    #[error("Message body could not be decoded: {message}")]
    Body { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Unsupported transport '{transport}': {message}")]
    UnsupportedTransport { transport: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
