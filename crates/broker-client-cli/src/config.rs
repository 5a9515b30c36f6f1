//! Client configuration.
//!
//! Sources, later ones overriding earlier ones:
//!  1. Built-in defaults (every field carries a serde default)
//!  2. Optional file given by `--config` or `BROKER_CLIENT_CONFIG`
//!     (format picked from the file extension: yaml, toml or json)
//!  3. Environment variables prefixed `BROKER_CLIENT__` with a
//!     double-underscore separator, e.g. `BROKER_CLIENT__ENDPOINT__HOST=broker`
//!  4. Command-line overrides, applied by the caller

use broker_runtime::{AddressName, Endpoint, RecoveryPolicy, ValidationError, DEFAULT_AMQP_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for configuration environment variables
pub const ENV_PREFIX: &str = "BROKER_CLIENT";

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidFormat(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Wire transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// AMQP 1.0 over TCP
    #[default]
    Amqp,
    /// Process-local broker, for smoke runs without a real broker
    InMemory,
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: EndpointConfig,

    /// Address produced to and subscribed on
    pub address: String,

    pub transport: TransportKind,

    pub recovery: RecoveryConfig,

    pub producer: ProducerConfig,

    pub consumer: ConsumerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            address: Self::DEFAULT_ADDRESS.to_string(),
            transport: TransportKind::default(),
            recovery: RecoveryConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Broker endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_AMQP_PORT,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

/// Reconnection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_ms: u64,
    pub retry_count: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let policy = RecoveryPolicy::default();
        Self {
            interval_ms: policy.interval.as_millis() as u64,
            retry_count: policy.retry_count,
        }
    }
}

/// Producer loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Pacing between successful sends
    pub interval_ms: u64,
    /// Wait after a failed send; 0 retries immediately
    pub error_delay_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            error_delay_ms: 0,
        }
    }
}

/// Consumer loop settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Wait after a failed receive or acknowledge; 0 retries immediately
    pub error_delay_ms: u64,
}

impl ClientConfig {
    pub const DEFAULT_ADDRESS: &'static str = "MyAddress";

    /// Check the resolved configuration before anything connects
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        self.address()?;

        if self.producer.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "producer.interval_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Ok(Endpoint::new(
            self.endpoint.host.clone(),
            self.endpoint.port,
            self.endpoint.username.clone(),
            self.endpoint.password.clone(),
        )?)
    }

    pub fn address(&self) -> Result<AddressName, ConfigError> {
        Ok(AddressName::new(self.address.clone())?)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::constant_backoff(
            Duration::from_millis(self.recovery.interval_ms),
            self.recovery.retry_count,
        )
    }

    pub fn producer_interval(&self) -> Duration {
        Duration::from_millis(self.producer.interval_ms)
    }

    pub fn producer_error_delay(&self) -> Duration {
        Duration::from_millis(self.producer.error_delay_ms)
    }

    pub fn consumer_error_delay(&self) -> Duration {
        Duration::from_millis(self.consumer.error_delay_ms)
    }
}

/// Load configuration from defaults, an optional file and the environment.
///
/// A missing explicit file is an error; an unconfigured environment yields
/// the built-in defaults.
pub fn load_configuration(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
