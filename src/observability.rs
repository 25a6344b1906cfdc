// Centralized logging setup for the storage server.
// Structured tracing with environment-based filtering; every worker and
// session logs through the same subscriber.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging and tracing infrastructure.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    // Determine the filter level based on flags
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("pimstore=debug,info")
    } else {
        // Default: warnings and errors for us, only errors for dependencies.
        // Users can enable more logging with --verbose or RUST_LOG.
        EnvFilter::new("pimstore=warn,error")
    };

    // Quiet takes precedence over the environment variable so that --quiet
    // always suppresses logs regardless of RUST_LOG.
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("pimstore observability initialized");
            }
            Ok(())
        }
        // Already initialized (tests set up their own subscriber)
        Err(_) => Ok(()),
    }
}
