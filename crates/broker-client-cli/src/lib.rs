//! # Broker Client CLI
//!
//! Command-line producer and consumer built on the broker runtime.
//!
//! This module provides:
//! - Argument parsing for the `produce` and `consume` commands
//! - Layered configuration loading (see [`config`])
//! - Logging initialisation
//! - Operator interrupt handling wired to the shared cancellation token
//!
//! Both commands connect once, run their loop until cancelled (by Ctrl-C,
//! SIGTERM or exhausted connection recovery) and release the connection
//! before returning.

#[cfg(feature = "amqp")]
use broker_runtime::AmqpConnector;
use broker_runtime::{
    subscribe, BrokerConnector, BrokerError, ConnectionFactory, ConsumerLoop, ConsumerSummary,
    InMemoryBroker, LoopObserver, ProducerLoop, ProducerSummary, QueueName, ReceivedMessage,
    RoutingType,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod config;

pub use config::{load_configuration, ClientConfig, ConfigError, TransportKind};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Broker client - reliable AMQP producer and consumer
#[derive(Parser, Debug)]
#[command(name = "broker-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reliable message producer and consumer for AMQP brokers")]
#[command(
    long_about = "Sends a paced, numbered message stream or consumes it through an exclusive subscription queue, recovering from connection loss"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BROKER_CLIENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Broker transport, overriding the configuration
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Send a numbered message stream to an address
    Produce {
        /// Address to send to
        #[arg(short, long)]
        address: Option<String>,

        /// Pause between successful sends, in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Subscribe to an address and print every message received
    Consume {
        /// Address to subscribe to
        #[arg(short, long)]
        address: Option<String>,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(BrokerError),

    #[error("Provisioning error: {0}")]
    Provisioning(BrokerError),

    #[error("Logging initialisation failed: {message}")]
    Logging { message: String },
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Configuration(_) => 1,
            CliError::Connection(_) => 2,
            CliError::Provisioning(_) => 3,
            CliError::Logging { .. } => 4,
        }
    }
}

// ============================================================================
// Console Reporting
// ============================================================================

/// Prints loop progress to stdout; failures go to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleObserver;

impl ConsoleObserver {
    pub const DISCONNECTED_LINE: &'static str = "Disconnected";

    pub fn attached_line(queue: &QueueName) -> String {
        format!("Attached to queue: {}", queue)
    }

    pub fn sent_line(counter: u64) -> String {
        format!("Message sent: {}", counter)
    }

    pub fn received_line(message: &ReceivedMessage) -> String {
        match message.body_as_str() {
            Ok(text) => format!("Received message: {}", text),
            Err(_) => format!(
                "Received message: <{} bytes, not UTF-8>",
                message.message.body.len()
            ),
        }
    }
}

impl LoopObserver for ConsoleObserver {
    fn message_sent(&self, counter: u64) {
        println!("{}", Self::sent_line(counter));
    }

    fn send_failed(&self, counter: u64, error: &BrokerError) {
        warn!(counter, error = %error, "Send failed");
    }

    fn message_received(&self, message: &ReceivedMessage) {
        println!("{}", Self::received_line(message));
    }

    fn receive_failed(&self, error: &BrokerError) {
        warn!(error = %error, "Receive failed");
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let mut config = load_configuration(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli);
    config.validate()?;

    let connector = build_connector(config.transport)?;
    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let result = match cli.command {
        Commands::Produce { .. } => execute_produce(&config, connector, cancel.clone())
            .await
            .map(|summary| {
                info!(
                    sent = summary.sent,
                    failed = summary.failed,
                    "Producer finished"
                )
            }),
        Commands::Consume { .. } => execute_consume(&config, connector, cancel.clone())
            .await
            .map(|summary| {
                info!(
                    received = summary.received,
                    errors = summary.errors,
                    "Consumer finished"
                )
            }),
    };

    signals.abort();
    result
}

/// Merge command-line values over the loaded configuration
pub fn apply_cli_overrides(config: &mut ClientConfig, cli: &Cli) {
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }

    match &cli.command {
        Commands::Produce {
            address,
            interval_ms,
        } => {
            if let Some(address) = address {
                config.address = address.clone();
            }
            if let Some(interval_ms) = interval_ms {
                config.producer.interval_ms = *interval_ms;
            }
        }
        Commands::Consume { address } => {
            if let Some(address) = address {
                config.address = address.clone();
            }
        }
    }
}

/// Initialize logging based on CLI arguments.
///
/// `RUST_LOG` takes precedence over `--log-level`. Logs go to stderr so
/// stdout carries only message lines.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_log_filter(&cli.log_level).into());

    let json = cli.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text = (!cli.json_logs)
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })
}

/// Filter directive applied when `RUST_LOG` is unset
pub fn default_log_filter(level: &str) -> String {
    format!("broker_client_cli={level},broker_runtime={level}")
}

/// Select the broker backend.
///
/// Fails for the AMQP transport when the `amqp` feature is disabled.
pub fn build_connector(
    transport: TransportKind,
) -> Result<Arc<dyn BrokerConnector>, CliError> {
    match transport {
        #[cfg(feature = "amqp")]
        TransportKind::Amqp => Ok(Arc::new(AmqpConnector::default())),
        #[cfg(not(feature = "amqp"))]
        TransportKind::Amqp => Err(CliError::Configuration(ConfigError::InvalidValue {
            key: "transport".to_string(),
            message: "built without the amqp feature".to_string(),
        })),
        TransportKind::InMemory => Ok(Arc::new(InMemoryBroker::new())),
    }
}

/// Cancel `cancel` on Ctrl-C or, on unix, SIGTERM
async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Run the producer loop until `cancel` fires or recovery is exhausted.
///
/// Cancellation before the loop starts is a clean exit.
pub async fn execute_produce(
    config: &ClientConfig,
    connector: Arc<dyn BrokerConnector>,
    cancel: CancellationToken,
) -> Result<ProducerSummary, CliError> {
    let stopped_early = ProducerSummary {
        next_counter: ProducerLoop::FIRST_COUNTER,
        ..ProducerSummary::default()
    };

    let endpoint = config.endpoint()?;
    let address = config.address()?;

    let connection = match ConnectionFactory::new(connector)
        .with_recovery_policy(config.recovery_policy())
        .connect(endpoint, &cancel)
        .await
    {
        Ok(connection) => connection,
        Err(e) if e.is_cancellation() => return Ok(stopped_early),
        Err(e) => return Err(CliError::Connection(e)),
    };
    let watcher = connection
        .recovery_failure()
        .map(|failure| failure.cancel_on_failure(cancel.clone()));

    let producer = match connection
        .create_producer(address, RoutingType::Multicast, &cancel)
        .await
    {
        Ok(producer) => producer,
        Err(e) => {
            release(connection, watcher).await;
            return if e.is_cancellation() {
                Ok(stopped_early)
            } else {
                Err(CliError::Connection(e))
            };
        }
    };

    let summary = ProducerLoop::new(producer, cancel.clone())
        .with_interval(config.producer_interval())
        .with_error_delay(config.producer_error_delay())
        .with_observer(Arc::new(ConsoleObserver))
        .run()
        .await;

    release(connection, watcher).await;
    Ok(summary)
}

/// Subscribe and run the consumer loop until `cancel` fires or recovery is
/// exhausted.
pub async fn execute_consume(
    config: &ClientConfig,
    connector: Arc<dyn BrokerConnector>,
    cancel: CancellationToken,
) -> Result<ConsumerSummary, CliError> {
    let endpoint = config.endpoint()?;
    let address = config.address()?;

    let connection = match ConnectionFactory::new(connector)
        .with_recovery_policy(config.recovery_policy())
        .connect(endpoint, &cancel)
        .await
    {
        Ok(connection) => connection,
        Err(e) if e.is_cancellation() => return Ok(ConsumerSummary::default()),
        Err(e) => return Err(CliError::Connection(e)),
    };
    let watcher = connection
        .recovery_failure()
        .map(|failure| failure.cancel_on_failure(cancel.clone()));

    let consumer = match subscribe(&connection, address, &cancel).await {
        Ok(consumer) => {
            println!("{}", ConsoleObserver::attached_line(consumer.queue()));
            consumer
        }
        Err(e) => {
            release(connection, watcher).await;
            return if e.is_cancellation() {
                Ok(ConsumerSummary::default())
            } else {
                Err(CliError::Provisioning(e))
            };
        }
    };

    let summary = ConsumerLoop::new(consumer, cancel.clone())
        .with_error_delay(config.consumer_error_delay())
        .with_observer(Arc::new(ConsoleObserver))
        .run()
        .await;

    release(connection, watcher).await;
    Ok(summary)
}

/// Close the connection and stop the failure watcher
async fn release(
    connection: broker_runtime::Connection,
    watcher: Option<tokio::task::JoinHandle<()>>,
) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Error while closing connection");
    }
    println!("{}", ConsoleObserver::DISCONNECTED_LINE);

    if let Some(watcher) = watcher {
        if let Err(e) = watcher.await {
            debug!(error = %e, "Recovery watcher ended abnormally");
        }
    }
}
