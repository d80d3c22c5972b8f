//! portquota - quota-limited TCP port forwarder
//!
//! Reads a rule file, forwards every rule's port to its upstream target and
//! writes the remaining quota back to the file on an interval and on exit.

use anyhow::{Context, Result};
use clap::Parser;
use portquota_config::ConfigStore;
use portquota_forward::{Forwarder, ForwarderSettings, FLOOD_TARGET, TIMEOUT_TARGET};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// portquota - forward TCP ports with byte quotas, expiry dates and connection caps
#[derive(Parser, Debug)]
#[command(name = "portquota")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Forwards TCP ports according to a JSON rule file. Every rule has a byte
quota, an optional expiry date and an optional cap on simultaneous
connections. Remaining quota is written back to the rule file periodically
and before exiting.

EXAMPLES:
  # Run with ./rules.json
  portquota

  # Use another rule file and log connection-limit rejections too
  portquota --config /etc/portquota/rules.json --verbose 2

VERBOSE LEVELS:
  0  Errors only
  1  Quota reached, expiry date and typical errors
  2  Connection floods (connection limit reached)
  3  Idle timeout drops
  4  Everything

ENVIRONMENT VARIABLES:
  PORTQUOTA_CONFIG   Rule file path
  RUST_LOG           Overrides the verbose level with a tracing filter
"#)]
struct Cli {
    /// The rule file
    #[arg(short, long, env = "PORTQUOTA_CONFIG", default_value = "rules.json")]
    config: PathBuf,

    /// Verbose level, 0 (mostly silent) to 4 (all logs)
    #[arg(short, long, default_value_t = 1)]
    verbose: u8,

    /// Address every rule listens on
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Do not save the rules before exiting
    #[arg(long)]
    no_exit_save: bool,
}

/// Tracing filter for a verbose level
fn verbosity_filter(verbose: u8) -> String {
    match verbose {
        0 => "error".to_string(),
        1 => format!("info,{}=off,{}=off", FLOOD_TARGET, TIMEOUT_TARGET),
        2 => format!("info,{}=off", TIMEOUT_TARGET),
        3 => "info".to_string(),
        _ => "trace".to_string(),
    }
}

/// Setup logging, `RUST_LOG` taking precedence over the verbose level
fn setup_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbose)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose >= 4).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Resolve on Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    if cli.verbose != 0 {
        info!("Verbose mode on level {}", cli.verbose);
    }

    let store = ConfigStore::new(&cli.config);
    let config = store
        .load()
        .with_context(|| format!("Failed to load rule file {}", cli.config.display()))?;
    info!(rules = config.rules.len(), "Loaded rule file");

    let settings = ForwarderSettings::from_config(&config).with_bind_ip(cli.bind_address);
    let forwarder = Forwarder::new(config, store)
        .with_settings(settings)
        .start()
        .await
        .context("Failed to start forwarding")?;

    info!("Ctrl + C to stop");
    shutdown_signal().await?;

    forwarder.shutdown(!cli.no_exit_save).await;
    info!("Exiting");
    Ok(())
}
