//! Broker endpoint descriptor.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Default AMQP port
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Username and password presented to the broker
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable connection target: host, port and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    credentials: Credentials,
}

impl Endpoint {
    /// Create new endpoint with validation
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let host = host.into();

        if host.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "host".to_string(),
            });
        }

        if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(ValidationError::InvalidFormat {
                field: "host".to_string(),
                message: "must not contain whitespace, '/' or '@'".to_string(),
            });
        }

        if port == 0 {
            return Err(ValidationError::OutOfRange {
                field: "port".to_string(),
                message: "must be between 1 and 65535".to_string(),
            });
        }

        Ok(Self {
            host,
            port,
            credentials: Credentials::new(username, password),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Connection URL including percent-encoded credentials.
    ///
    /// Never log this value; use the `Display` form instead.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            urlencoding::encode(self.credentials.username()),
            urlencoding::encode(self.credentials.password()),
            self.host,
            self.port
        )
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "amqp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
