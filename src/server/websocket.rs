//! WebSocket server implementation
//!
//! Listens for dashboard clients, upgrades requests on the telemetry path and
//! hands each upgraded socket to the hub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::handler::{ClientConnection, ConnectionConfig};
use crate::hub::HubHandle;

/// Default telemetry path
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default cap on simultaneous connections
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Default time a peer gets to complete the upgrade
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// HTTP path accepting the upgrade
    pub path: String,
    /// Maximum simultaneous connections
    pub max_clients: usize,
    /// Time allowed between accept and a finished upgrade
    pub handshake_timeout: Duration,
    /// Per-connection timing
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            path: DEFAULT_WS_PATH.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connection: ConnectionConfig::default(),
        }
    }

    /// Set the upgrade path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the connection cap
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set the upgrade deadline
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set per-connection timing
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket upgrade endpoint for dashboard clients
pub struct WebSocketServer {
    config: Arc<ServerConfig>,
    hub: HubHandle,
    active: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server feeding the given hub
    pub fn new(config: ServerConfig, hub: HubHandle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            hub,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of sockets currently held by the server
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind to the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// Live connections are not touched here; they end when the hub shuts
    /// down.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}{}", addr, self.config.path);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = self.hub.clone();
                            let config = Arc::clone(&self.config);
                            let guard = ActiveGuard::new(Arc::clone(&self.active));

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, hub, config, guard).await {
                                    debug!("Connection from {} ended early: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Counts a socket as active for as long as it lives
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    count: usize,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        Self { active, count }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Upgrade a single TCP connection and run it until it closes
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: HubHandle,
    config: Arc<ServerConfig>,
    guard: ActiveGuard,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let over_capacity = guard.count > config.max_clients;
    let callback = |request: &Request, response: Response| {
        let path = request.uri().path();
        if path != config.path {
            warn!("Rejected upgrade from {} on unknown path {}", peer_addr, path);
            return Err(reject(StatusCode::NOT_FOUND, "Not found"));
        }
        if over_capacity {
            warn!("Rejected upgrade from {}: connection limit reached", peer_addr);
            return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "Too many connections"));
        }
        Ok(response)
    };

    // A peer that never finishes the upgrade must not hold a slot
    let handshake = accept_hdr_async(stream, callback);
    let ws_stream = tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| anyhow::anyhow!("Handshake timed out after {:?}", config.handshake_timeout))??;
    let connection = ClientConnection::accept(ws_stream, peer_addr, hub, config.connection).await?;
    info!(client_id = %connection.id(), "Dashboard client connected from {}", peer_addr);

    connection.run().await;
    drop(guard);
    Ok(())
}
