//! flowgate - throughput test server
//!
//! Listens for stream or datagram test flows and drains them, reporting
//! per-flow totals and returning a summary to datagram senders.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use flowgate::{
    config::{ConfigManager, Transport},
    connection::{Listener, SinkWorker},
    metrics::{Metrics, MetricsServer},
    registry::GroupRegistry,
    ShutdownCoordinator,
};

/// CLI arguments for flowgate
#[derive(Parser, Debug)]
#[command(name = "flowgate")]
#[command(about = "flowgate - throughput measurement server")]
#[command(version)]
#[command(long_about = "
flowgate - throughput measurement server

Accepts test flows from measurement clients over TCP or UDP, exchanges
protocol versions with each peer, and reports per-flow and per-host totals.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  FLOWGATE_BIND_ADDR         - Bind address (e.g., 0.0.0.0:5001)
  FLOWGATE_TRANSPORT         - tcp or udp
  FLOWGATE_BUFFER_LEN        - Read buffer length in bytes
  FLOWGATE_MAX_FLOWS         - Flows to serve before exiting (0 = unlimited)
  FLOWGATE_DURATION          - Server run duration (e.g., 30s)
  FLOWGATE_REPORT_INTERVAL   - Report interval (e.g., 1s)
  FLOWGATE_CLIENT_FILTER     - Only accept flows from this host
  FLOWGATE_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "flowgate.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address or host (overrides config file)
    #[arg(short = 'B', long, help = "Bind address (e.g., 0.0.0.0:5001 or 239.1.1.1)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Serve UDP instead of TCP
    #[arg(short, long, help = "Use UDP rather than TCP")]
    pub udp: bool,

    /// Handle all UDP flows in the listener task
    #[arg(long, help = "Run UDP in single-context mode")]
    pub single_udp: bool,

    /// Serve one client host at a time
    #[arg(short = '1', long, help = "Serve one client host at a time")]
    pub single_client: bool,

    /// Only accept flows from this host
    #[arg(long, help = "Only accept flows from this host")]
    pub client: Option<IpAddr>,

    /// Flows to serve before exiting
    #[arg(short = 'P', long, help = "Number of flows to serve before exiting (0 = unlimited)")]
    pub parallel: Option<usize>,

    /// Report interval
    #[arg(short, long, value_parser = humantime::parse_duration, help = "Report interval (e.g., 1s)")]
    pub interval: Option<Duration>,

    /// Server run duration
    #[arg(short, long, value_parser = humantime::parse_duration, help = "Run duration (e.g., 30s)")]
    pub time: Option<Duration>,

    /// Read buffer length in bytes
    #[arg(short, long, help = "Read buffer length in bytes")]
    pub len: Option<usize>,

    /// Skip the version exchange
    #[arg(short = 'C', long, help = "Compatibility mode for peers without version exchange")]
    pub compat: bool,

    /// Run detached from the run duration
    #[arg(short = 'D', long, help = "Daemon mode")]
    pub daemon: bool,

    /// Keep listening after the run duration elapses
    #[arg(long, help = "Keep listening after the run duration elapses")]
    pub repeat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level (defaults to monitoring.log_level)")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let filter_handle = init_tracing(&args)?;

    info!("Starting flowgate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.udp,
        args.single_udp,
        args.single_client,
        args.client,
        args.parallel,
        args.interval,
        args.time,
        args.len,
        args.compat,
        args.daemon,
    );
    if args.repeat {
        config.server.repeat = true;
    }

    config
        .validate()
        .context("Final configuration validation failed")?;
    config.normalize();

    if let Some(handle) = &filter_handle {
        if let Err(e) = handle.reload(EnvFilter::new(&config.monitoring.log_level)) {
            warn!("Failed to apply configured log level: {}", e);
        }
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Transport: {}", config.server.transport);
        info!("  Buffer length: {} bytes", config.server.buffer_len);
        info!("  Max flows: {}", config.server.max_flows);
        info!("  Single client: {}", config.server.single_client);
        info!("  Single-context UDP: {}", config.server.single_udp);
        info!("  Run duration: {:?}", config.server.duration);
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(Metrics::new()?);

    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(Arc::clone(&metrics), addr)
                .await
                .with_context(|| format!("Failed to bind metrics endpoint {}", addr))?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("Metrics server error: {}", e);
                }
            }))
        }
        None => None,
    };

    let registry = Arc::new(GroupRegistry::new());
    let worker = Arc::new(SinkWorker::new(Arc::clone(&registry)));
    let mut listener = Listener::with_registry(
        Arc::clone(&config),
        worker,
        shutdown_coordinator.clone(),
        registry,
    )
    .with_metrics(Arc::clone(&metrics));

    let local = listener.bind().context("Failed to bind listening endpoint")?;
    let transport = match config.server.transport {
        Transport::Tcp => "TCP",
        Transport::Udp => "UDP",
    };
    info!(
        "Server listening on {} port {} (buffer {} bytes)",
        transport,
        local.port(),
        config.server.buffer_len
    );

    let signal_coordinator = shutdown_coordinator.clone();
    let signal_handle = tokio::spawn(async move {
        if let Err(e) = signal_coordinator.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    // Daemons do not bound their accept waits, so the duration arrives as an interrupt.
    let timer_handle = match (config.server.daemon, config.server.duration) {
        (true, Some(duration)) if !duration.is_zero() => {
            Some(shutdown_coordinator.spawn_duration_timer(duration))
        }
        _ => None,
    };

    let result = listener.run().await;

    shutdown_coordinator.shutdown();
    signal_handle.abort();
    if let Some(handle) = timer_handle {
        handle.abort();
    }
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    match result {
        Ok(reason) => {
            info!(
                reason = ?reason,
                accepted = metrics.accepted(),
                rejected = metrics.rejected(),
                "Server shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!("Listener failed: {:#}", e);
            Err(e)
        }
    }
}

/// Initialize tracing/logging. Returns a handle for applying the configured
/// level later, unless the level was fixed by RUST_LOG or the command line.
fn init_tracing(args: &CliArgs) -> Result<Option<FilterHandle>> {
    let explicit = args.verbose || args.log_level.is_some();
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or("info")
    };

    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(log_level), false),
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok((!explicit && !from_env).then_some(handle))
}
