//! hpc-console - operator console for a remote HPC cluster
//!
//! One SSH session to the login host carries ad-hoc commands, Slurm job
//! management and local port forwards to compute nodes.

pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod forwarding;
pub mod repl;
pub mod scheduler;
pub mod ssh;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConsoleConfig, Credentials, HostKeyPolicy, RelayMode, TunnelSettings};
pub use connection::ConnectionManager;
pub use console::Console;
pub use error::ConsoleError;
pub use forwarding::{TunnelInfo, TunnelManager};

/// Initialize logging. Logs go to stderr so they do not mix with REPL output.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load configuration, log in and serve the REPL on stdin/stdout until
/// logout, end of input or Ctrl-C.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), ConsoleError> {
    let storage = match config_path {
        Some(path) => config::ConfigStorage::with_path(path),
        None => config::ConfigStorage::new()?,
    };
    let config = storage.load_with_env().await?;
    tracing::debug!("Configuration: {:?}", config);

    let credentials = config.credentials()?;
    let console = Console::new(&config)?;

    console.login(&credentials).await?;
    println!(
        "Logged in to {} as {}. Type 'help' for commands.",
        config.host, credentials.username
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = repl::run(&console, stdin, stdout) => {
            if let Err(e) = result {
                tracing::warn!("Console I/O error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    console.shutdown().await;
    Ok(())
}
