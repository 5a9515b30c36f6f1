//! Message types and routing identifiers.

use crate::error::{DecodeError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Routing Identifiers
// ============================================================================

/// Separator used by brokers for fully qualified queue names (`address::queue`)
pub const FQQN_SEPARATOR: &str = "::";

const MAX_NAME_LENGTH: usize = 255;

fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("maximum {} characters", MAX_NAME_LENGTH),
        });
    }

    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "whitespace and control characters are not allowed".to_string(),
        });
    }

    // Reserved for fully qualified queue names
    if name.contains(FQQN_SEPARATOR) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: format!("must not contain '{}'", FQQN_SEPARATOR),
        });
    }

    Ok(())
}

/// Validated address name (logical routing destination)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressName(String);

impl AddressName {
    /// Create new address name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("address", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AddressName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AddressName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validated queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("queue_name", &name)?;
        Ok(Self(name))
    }

    /// Generate a fresh random queue name.
    ///
    /// Exclusive subscription queues must never reuse a name across runs, so
    /// every consumer instantiation calls this once at startup.
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Fully qualified queue name (`address::queue`)
    pub fn qualified(&self, address: &AddressName) -> String {
        format!("{}{}{}", address, FQQN_SEPARATOR, self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unique identifier for messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-assigned token identifying one unsettled delivery on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent through the broker: opaque body plus optional metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub body: Bytes,
    pub properties: HashMap<String, String>,
}

impl Message {
    /// Create new message with the given body
    pub fn new(body: Bytes) -> Self {
        Self {
            message_id: MessageId::new(),
            body,
            properties: HashMap::new(),
        }
    }

    /// Create new message whose body is the UTF-8 encoding of `text`
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Bytes::from(text.into()))
    }

    /// Add a metadata property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Decode the body as a UTF-8 string
    pub fn body_as_str(&self) -> Result<&str, DecodeError> {
        Ok(std::str::from_utf8(&self.body)?)
    }
}

/// A message delivered to a consumer link
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub tag: DeliveryTag,
    /// Number of times the broker has delivered this message, starting at 1
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl ReceivedMessage {
    pub fn body_as_str(&self) -> Result<&str, DecodeError> {
        self.message.body_as_str()
    }
}

/// A received but not yet acknowledged message.
///
/// Owned exclusively by the consumer that received it and consumed by
/// acknowledgment, so a settled delivery cannot be acknowledged again.
#[derive(Debug)]
pub struct DeliveryHandle {
    message: ReceivedMessage,
    link_generation: u64,
}

impl DeliveryHandle {
    pub(crate) fn new(message: ReceivedMessage, link_generation: u64) -> Self {
        Self {
            message,
            link_generation,
        }
    }

    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub fn tag(&self) -> DeliveryTag {
        self.message.tag
    }

    pub(crate) fn link_generation(&self) -> u64 {
        self.link_generation
    }

    pub(crate) fn into_message(self) -> ReceivedMessage {
        self.message
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
