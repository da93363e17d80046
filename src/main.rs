//! Transit - single-port, two-way TCP relay
//!
//! Listens on one port for both peers, forwards each connection to the
//! other peer, and mirrors downstream traffic to an optional third party.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transit::{config::ConfigManager, Config, RelayListener, ShutdownCoordinator};

/// CLI arguments for Transit
#[derive(Parser, Debug)]
#[command(name = "transit")]
#[command(about = "Transit - single-port, two-way TCP relay")]
#[command(version)]
#[command(long_about = "
Transit - single-port, two-way TCP relay

Connections from the downstream peer are forwarded to the upstream peer and
mirrored to an optional third party. Connections from the upstream peer are
forwarded to the downstream peer only. Any other source is closed.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file (TOML, or legacy JSON with a .json extension)

Environment variables:
  TRANSIT_BIND_IP       - Local IPv4 address to listen on
  TRANSIT_PORT          - Relay port (also used to reach the peers)
  TRANSIT_DOWNSTREAM    - Downstream peer IP
  TRANSIT_UPSTREAM      - Upstream peer IP
  TRANSIT_THIRD_PARTY   - Third party host:port (empty disables)
  TRANSIT_DIAL_TIMEOUT  - Outbound dial timeout (e.g., 5s, 500ms)
  TRANSIT_LOG_LEVEL     - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/usr/local/etc/transit.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind IP (overrides config file)
    #[arg(long, help = "Local IPv4 address to listen on")]
    pub bind_ip: Option<String>,

    /// Port (overrides config file)
    #[arg(short, long, help = "Relay port")]
    pub port: Option<u16>,

    /// Third party address (overrides config file)
    #[arg(long, help = "Third party host:port, empty to disable")]
    pub third_party: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config = load_config(&args)?;

    init_tracing(&args, &config)?;

    info!("Starting Transit v{}", env!("CARGO_PKG_VERSION"));
    info!("  Listen address: {}", config.relay.bind_addr());
    info!("  Advertised IP: {}", config.relay.local_ip());
    info!("  Downstream peer: {}", config.peers.downstream);
    info!("  Upstream peer: {}", config.peers.upstream);
    info!(
        "  Third party: {}",
        config.third_party.as_deref().unwrap_or("disabled")
    );
    info!("  Dial timeout: {:?}", config.relay.dial_timeout);

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let listener = Arc::new(
        RelayListener::bind(&config)
            .await
            .context("Relay failed to start")?,
    );

    let mut server_handle = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    let shutdown_coordinator = ShutdownCoordinator::new(config.relay.shutdown_timeout);

    info!("Transit started, press Ctrl+C or send SIGTERM to stop");

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Accept loop finished"),
                Ok(Err(e)) => {
                    error!("Accept loop failed: {:#}", e);
                    shutdown_coordinator.shutdown_listener(&listener).await?;
                    return Err(e);
                }
                Err(e) => error!("Accept loop task failed: {}", e),
            }
        }
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
    }

    shutdown_coordinator.shutdown_listener(&listener).await?;

    if !server_handle.is_finished() {
        if let Err(e) = server_handle.await {
            if !e.is_cancelled() {
                error!("Accept loop task failed: {}", e);
            }
        }
    }

    info!("Relay shutdown complete");
    Ok(())
}

/// Load configuration: file, then environment, then CLI overrides
fn load_config(args: &CliArgs) -> Result<Config> {
    let config = ConfigManager::load_from_file(&args.config)?;
    let mut config = ConfigManager::load_from_env(config)?;

    config.merge_with_cli_args(
        args.bind_ip.as_deref(),
        args.port,
        args.third_party.as_deref(),
        args.log_level.as_deref(),
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    Ok(config)
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
