//! Tests for configuration loading and validation.

use super::*;
use serial_test::serial;
use std::io::Write;

/// Remove every `BROKER_CLIENT__*` variable so tests start from defaults
fn clear_environment() {
    let prefix = format!("{}__", ENV_PREFIX);
    for (key, _) in std::env::vars() {
        if key.starts_with(&prefix) {
            std::env::remove_var(key);
        }
    }
}

fn write_file(extension: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(&format!(".{}", extension))
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// ============================================================================
// Default Tests
// ============================================================================

mod defaults {
    use super::*;

    /// Verify that the built-in defaults describe a local broker.
    #[test]
    fn test_default_configuration() {
        let config = ClientConfig::default();

        assert_eq!(config.endpoint.host, "localhost");
        assert_eq!(config.endpoint.port, 5672);
        assert_eq!(config.endpoint.username, "guest");
        assert_eq!(config.endpoint.password, "guest");
        assert_eq!(config.address, "MyAddress");
        assert_eq!(config.transport, TransportKind::Amqp);
        assert_eq!(config.recovery_policy(), RecoveryPolicy::default());
        assert_eq!(config.producer_interval(), Duration::from_secs(1));
        assert_eq!(config.producer_error_delay(), Duration::ZERO);
        assert_eq!(config.consumer_error_delay(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_without_sources_yields_defaults() {
        clear_environment();

        let config = load_configuration(None).unwrap();

        assert_eq!(config, ClientConfig::default());
    }
}

// ============================================================================
// File Source Tests
// ============================================================================

mod file_source {
    use super::*;

    /// Verify that a partial YAML file overrides only the fields it names.
    #[test]
    #[serial]
    fn test_yaml_file_overrides_defaults() {
        clear_environment();
        let file = write_file(
            "yaml",
            "endpoint:\n  host: broker.internal\n  port: 61616\naddress: Orders\nrecovery:\n  retry_count: 2\n",
        );

        let config = load_configuration(Some(file.path())).unwrap();

        assert_eq!(config.endpoint.host, "broker.internal");
        assert_eq!(config.endpoint.port, 61616);
        assert_eq!(config.endpoint.username, "guest");
        assert_eq!(config.address, "Orders");
        assert_eq!(config.recovery.retry_count, 2);
        assert_eq!(config.recovery.interval_ms, 5000);
    }

    #[test]
    #[serial]
    fn test_toml_file_selects_transport() {
        clear_environment();
        let file = write_file(
            "toml",
            "transport = \"in-memory\"\n\n[producer]\ninterval_ms = 250\n",
        );

        let config = load_configuration(Some(file.path())).unwrap();

        assert_eq!(config.transport, TransportKind::InMemory);
        assert_eq!(config.producer_interval(), Duration::from_millis(250));
    }

    /// Verify that an explicitly named file must exist.
    #[test]
    #[serial]
    fn test_missing_file_rejected() {
        clear_environment();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let result = load_configuration(Some(&path));

        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    #[serial]
    fn test_malformed_file_rejected() {
        clear_environment();
        let file = write_file("json", "{ \"endpoint\": ");

        let result = load_configuration(Some(file.path()));

        assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
    }
}

// ============================================================================
// Environment Source Tests
// ============================================================================

mod environment_source {
    use super::*;

    /// Verify that environment variables take precedence over the file.
    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        clear_environment();
        let file = write_file("yaml", "endpoint:\n  host: from-file\naddress: FileAddress\n");
        std::env::set_var("BROKER_CLIENT__ENDPOINT__HOST", "from-env");
        std::env::set_var("BROKER_CLIENT__RECOVERY__INTERVAL_MS", "100");

        let result = load_configuration(Some(file.path()));
        clear_environment();
        let config = result.unwrap();

        assert_eq!(config.endpoint.host, "from-env");
        assert_eq!(config.address, "FileAddress");
        assert_eq!(
            config.recovery_policy().interval,
            Duration::from_millis(100)
        );
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_empty_host_rejected() {
        let mut config = ClientConfig::default();
        config.endpoint.host = "  ".to_string();

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_empty_address_rejected() {
        let mut config = ClientConfig::default();
        config.address = String::new();

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    /// Verify that a zero pacing interval is refused.
    #[test]
    fn test_zero_producer_interval_rejected() {
        let mut config = ClientConfig::default();
        config.producer.interval_ms = 0;

        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "producer.interval_ms")
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_carries_credentials() {
        let mut config = ClientConfig::default();
        config.endpoint.username = "admin".to_string();
        config.endpoint.password = "secret".to_string();

        let endpoint = config.endpoint().unwrap();

        assert_eq!(endpoint.host(), "localhost");
        assert_eq!(endpoint.credentials().username(), "admin");
        assert_eq!(endpoint.credentials().password(), "secret");
    }
}
