use broker_client_cli::{run_cli, CliError};
use tracing::error;

#[tokio::main]
async fn main() {
    // Run CLI and handle errors
    if let Err(e) = run_cli().await {
        match &e {
            // No subscriber is installed, so the log line would be lost
            CliError::Logging { .. } => eprintln!("broker-client: {}", e),
            _ => error!("CLI error: {}", e),
        }

        std::process::exit(e.exit_code());
    }
}
