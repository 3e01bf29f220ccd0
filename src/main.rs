//! Cyber Hub
//!
//! Real-time container telemetry for the Cyber Container Platform dashboard.
//! Samples the container engine on a fixed interval and pushes each snapshot
//! to every connected WebSocket client.

mod config;
mod engine;
mod hub;
mod server;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{Settings, DEFAULT_CONFIG_FILE};
use engine::ContainerLister;
use hub::{Hub, HubHandle};
use server::WebSocketServer;
use telemetry::TelemetryPoller;

/// Interval between status log lines
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Cyber Hub
///
/// Container telemetry broadcast over WebSocket
#[derive(Parser, Debug)]
#[command(name = "cyber-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "WS_PORT")]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Seconds between container samples (overrides the config file)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .compact()
            .init();
    } else {
        let log_level = if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };

        FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .compact()
            .init();
    }

    info!("Cyber Hub v{}", env!("CARGO_PKG_VERSION"));

    if !args.config.exists() {
        info!("No config file at {}, using defaults", args.config.display());
    }
    let mut settings = Settings::load(&args.config)?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    if let Some(secs) = args.poll_interval {
        settings.telemetry.poll_interval_secs = secs;
    }
    settings.validate()?;

    // Start the hub
    let (hub, hub_handle) = Hub::new(settings.hub_config());
    let hub_task = tokio::spawn(hub.run());

    // Create the WebSocket server
    let server = Arc::new(WebSocketServer::new(settings.server_config(), hub_handle.clone()));

    // Start the telemetry poller; it stops with the server
    let docker = settings.docker_cli()?;
    let command = docker.command().join(" ");
    let lister: Arc<dyn ContainerLister> = Arc::new(docker);
    let poller = TelemetryPoller::new(lister, hub_handle.clone(), settings.poll_interval());
    info!(
        "Sampling containers every {:?} via `{}`",
        poller.interval(),
        command
    );
    let poller_task = tokio::spawn(poller.run(server.shutdown_signal()));

    // Periodic status line
    tokio::spawn(report_status(
        hub_handle.clone(),
        Arc::clone(&server),
        server.shutdown_signal(),
    ));

    // Spawn shutdown signal handler
    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    let result = server.run().await;
    if let Err(e) = &result {
        error!("Server error: {}", e);
        server.shutdown();
    }

    match poller_task.await {
        Ok(stats) => info!(
            successes = stats.successes,
            failures = stats.failures,
            last_snapshot_age = ?stats.last_success.map(|at| at.elapsed()),
            "Telemetry poller finished"
        ),
        Err(e) => warn!("Telemetry poller task failed: {}", e),
    }

    log_status(&hub_handle, &server).await;

    // Close every client, then wait for the hub loop to exit
    if tokio::time::timeout(Duration::from_secs(10), hub_handle.shutdown())
        .await
        .is_err()
    {
        warn!("Hub did not stop in time");
    }
    drop(hub_handle);
    if let Err(e) = hub_task.await {
        warn!("Hub task failed: {}", e);
    }

    result?;
    info!("Server shutdown complete");
    Ok(())
}

/// Log hub and server counters; returns false once the hub has stopped
async fn log_status(hub: &HubHandle, server: &WebSocketServer) -> bool {
    match hub.stats().await {
        Ok(stats) => {
            info!(
                clients = stats.clients.len(),
                sockets = server.active_connections(),
                broadcasts = stats.broadcasts,
                evictions = stats.evictions,
                "Hub status"
            );
            true
        }
        Err(e) => {
            warn!("Hub status unavailable: {}", e);
            false
        }
    }
}

/// Log status every [`STATUS_INTERVAL`] until shutdown
async fn report_status(
    hub: HubHandle,
    server: Arc<WebSocketServer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + STATUS_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, STATUS_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !log_status(&hub, &server).await {
                    break;
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
