// Pimstore storage server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use pimstore::config::{Instance, ServerConfig};
use pimstore::init_logging_with_level;
use pimstore::server::Server;

#[derive(Parser)]
#[command(
    name = "pimstore",
    about = "Local PIM storage and coordination service",
    version
)]
struct Cli {
    /// Override the config file location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run as a named instance; the identifier is appended to service
    /// names and data directories
    #[arg(long, value_name = "ID")]
    instance: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

async fn run(cli: Cli) -> Result<()> {
    let instance = Instance::new(cli.instance);
    let config = ServerConfig::load(cli.config.as_deref(), &instance)?;

    init_logging_with_level(cli.verbose, cli.quiet)?;
    if let Some(id) = instance.identifier() {
        info!(instance = id, "starting in multi-instance mode");
    }

    // The control process publishes its socket before starting us; if it
    // is not there we are running without supervision and must not.
    let control_socket = instance.control_socket();
    if !control_socket.exists() {
        anyhow::bail!(
            "control service not available at {}, refusing to run",
            control_socket.display()
        );
    }

    std::fs::create_dir_all(instance.data_dir())
        .with_context(|| format!("Failed to create data directory {}", instance.data_dir().display()))?;

    let server = Server::start(config, instance).await?;
    server.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "fatal initialization failure");
            eprintln!("pimstore: {e:#}");
            ExitCode::FAILURE
        }
    }
}
