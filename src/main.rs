//! tcplink - resilient TCP listener and dialer
//!
//! Runs any number of listener and dialer services until a termination
//! signal arrives, then stops them all gracefully.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcplink::{
    config::{ConfigManager, HandlerKind},
    connection::{EchoHandler, LoggingHandler},
    CancellationController, Config, ConnectionHandler, DialerService, ListenerService, Metrics,
};

/// CLI arguments for tcplink
#[derive(Parser, Debug)]
#[command(name = "tcplink")]
#[command(about = "tcplink - resilient TCP listener and dialer")]
#[command(version)]
#[command(long_about = "
tcplink - resilient TCP listener and dialer

Listeners keep retrying while their address is in use and track every
connected peer. Dialers keep reconnecting to their remote endpoint and
rotate the local source port when it is occupied.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables (used when the config file does not exist):
  TCPLINK_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
  TCPLINK_SHUTDOWN_TIMEOUT  - Shutdown timeout (e.g., 10s, 1m)
  TCPLINK_LISTEN            - Listener endpoint (e.g., 0.0.0.0:7000)
  TCPLINK_CONNECT           - Dialer remote endpoint (e.g., 10.0.0.2:7000)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listener endpoints (repeatable)
    #[arg(short, long, help = "Listen on ADDR:PORT")]
    pub listen: Vec<String>,

    /// Dialer remote endpoints (repeatable)
    #[arg(long, help = "Connect to ADDR:PORT")]
    pub connect: Vec<String>,

    /// Local source endpoint for CLI dialers
    #[arg(short, long, help = "Local source ADDR:PORT for --connect dialers")]
    pub source: Option<String>,

    /// Echo received data back instead of logging it
    #[arg(long, help = "Use the echo handler for every service")]
    pub echo: bool,

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

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        &args.listen,
        &args.connect,
        args.source.as_deref(),
        args.echo,
        args.log_level.as_deref(),
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config)?;

    info!("Starting tcplink v{}", env!("CARGO_PKG_VERSION"));
    log_summary(&config);

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    if config.listeners.is_empty() && config.dialers.is_empty() {
        bail!("Nothing to run: configure at least one listener or dialer (see --help)");
    }

    let metrics = Arc::new(Metrics::new()?);
    let controller = CancellationController::new(config.general.shutdown_timeout, metrics);
    let read_buffer_size = config.general.read_buffer_size;

    for listener in &config.listeners {
        let handler = build_handler(listener.handler, &listener.display_name());
        let service = ListenerService::new(listener.clone(), handler, controller.context())
            .with_read_buffer_size(read_buffer_size);
        controller.spawn(service.name().to_string(), service.serve());
    }

    for dialer in &config.dialers {
        let handler = build_handler(dialer.handler, &dialer.display_name());
        let service = DialerService::new(dialer.clone(), handler, controller.context())
            .with_read_buffer_size(read_buffer_size);
        controller.spawn(service.name().to_string(), service.run());
    }

    info!(
        "tcplink started with {} tasks; send SIGTERM/SIGINT to shutdown gracefully",
        controller.task_names().len()
    );

    tokio::select! {
        signal = controller.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        _ = controller.wait_for_failure() => {
            warn!("A service failed, shutting down the remaining ones");
        }
    }

    let report = controller.shutdown().await;

    match controller.metrics().render() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => debug!("Could not render metrics: {}", e),
    }

    if let Some((name, e)) = report.failed.into_iter().next() {
        return Err(e.context(format!("{} failed", name)));
    }
    if !report.aborted.is_empty() {
        warn!(
            "Tasks aborted at the shutdown deadline: {}",
            report.aborted.join(", ")
        );
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_handler(kind: HandlerKind, name: &str) -> Arc<dyn ConnectionHandler> {
    match kind {
        HandlerKind::Log => Arc::new(LoggingHandler::new(name)),
        HandlerKind::Echo => Arc::new(EchoHandler),
    }
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Shutdown timeout: {:?}", config.general.shutdown_timeout);
    info!("  Read buffer size: {} bytes", config.general.read_buffer_size);
    for listener in &config.listeners {
        info!(
            "  Listener: {} (handler: {:?})",
            listener.display_name(),
            listener.handler
        );
    }
    for dialer in &config.dialers {
        info!(
            "  Dialer: {} (source port {}, {} rotations, handler: {:?})",
            dialer.display_name(),
            dialer.local_port,
            dialer.max_source_port_retries,
            dialer.handler
        );
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
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
