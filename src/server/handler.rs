//! WebSocket connection handler
//!
//! Bridges one upgraded socket to the hub. The write loop drains the
//! client's outbound queue onto the socket; the read loop watches the peer
//! for control frames and disconnects. Whichever loop ends first moves the
//! connection to `Closing` and unregisters it; the other loop follows.
//!
//! An eviction aborts even a write in progress. A hub shutdown first flushes
//! what is already queued, each write bounded by the write timeout, then
//! sends the close frame.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::protocol::Message;
use crate::hub::{ClientId, ClientMailbox, HubHandle, HubResult, MailboxEvent};

/// Default interval between keep-alive pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound on a single socket write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport errors on a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and receiving broadcasts
    Active,
    /// One loop has ended; the other is winding down
    Closing,
    /// Both loops have ended and the socket is released
    Closed,
}

/// Per-connection timing
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Interval between keep-alive pings
    pub ping_interval: Duration,
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// One registered dashboard client
pub struct ClientConnection<S> {
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    mailbox: ClientMailbox,
    hub: HubHandle,
    config: ConnectionConfig,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Register a freshly upgraded socket with the hub.
    ///
    /// On error the socket is dropped without further traffic.
    pub async fn accept(
        ws: WebSocketStream<S>,
        peer: SocketAddr,
        hub: HubHandle,
        config: ConnectionConfig,
    ) -> HubResult<Self> {
        let (client, mailbox) = hub.client_channel();
        hub.register(client).await?;
        debug!(client_id = %mailbox.id(), %peer, "Client connection registered");

        Ok(Self {
            ws,
            peer,
            mailbox,
            hub,
            config,
        })
    }

    /// Get the client ID
    pub fn id(&self) -> ClientId {
        self.mailbox.id()
    }

    /// Run both loops until the connection is closed
    pub async fn run(self) -> ConnectionState {
        let Self {
            ws,
            peer,
            mailbox,
            hub,
            config,
        } = self;

        let lifecycle = Lifecycle::new(mailbox.id(), peer, hub);
        let (sink, stream) = ws.split();

        tokio::join!(
            write_loop(sink, mailbox, &lifecycle, config),
            read_loop(stream, &lifecycle),
        );

        lifecycle.state.send_replace(ConnectionState::Closed);
        info!(client_id = %lifecycle.id, %peer, "Connection closed");
        ConnectionState::Closed
    }
}

/// State shared by the two loops of one connection
struct Lifecycle {
    id: ClientId,
    peer: SocketAddr,
    hub: HubHandle,
    state: watch::Sender<ConnectionState>,
}

impl Lifecycle {
    fn new(id: ClientId, peer: SocketAddr, hub: HubHandle) -> Self {
        let (state, _) = watch::channel(ConnectionState::Active);
        Self {
            id,
            peer,
            hub,
            state,
        }
    }

    /// Move to `Closing`; the first caller unregisters from the hub
    async fn begin_closing(&self, cause: &str) {
        let first = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Active {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if first {
            debug!(client_id = %self.id, peer = %self.peer, cause, "Connection closing");
            self.hub.unregister(self.id).await;
        }
    }
}

/// Resolves once the connection has left `Active`
async fn left_active(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s != ConnectionState::Active).await;
}

async fn send_frame<K>(sink: &mut K, frame: WsMessage, timeout: Duration) -> ConnectionResult<()>
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    tokio::time::timeout(timeout, sink.send(frame))
        .await
        .map_err(|_| ConnectionError::WriteTimeout(timeout))??;
    Ok(())
}

async fn write_loop<K>(
    mut sink: K,
    mut mailbox: ClientMailbox,
    lifecycle: &Lifecycle,
    config: ConnectionConfig,
) where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut state = lifecycle.state.subscribe();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (cause, close_frame) = loop {
        tokio::select! {
            event = mailbox.next() => match event {
                MailboxEvent::Message(text) => {
                    let frame = WsMessage::Text(text.to_string());
                    tokio::select! {
                        biased;
                        reason = mailbox.evicted() => {
                            break ("evicted by hub", Some(reason.close_frame()));
                        }
                        sent = send_frame(&mut sink, frame, config.write_timeout) => {
                            if let Err(e) = sent {
                                warn!(client_id = %lifecycle.id, "Write failed: {}", e);
                                break ("write error", None);
                            }
                        }
                    }
                }
                MailboxEvent::Closed(reason) => {
                    break ("released by hub", reason.map(|r| r.close_frame()));
                }
            },
            _ = ping.tick() => {
                if let Err(e) = send_frame(&mut sink, WsMessage::Ping(Vec::new()), config.write_timeout).await {
                    warn!(client_id = %lifecycle.id, "Ping failed: {}", e);
                    break ("ping error", None);
                }
            }
            _ = left_active(&mut state) => {
                break ("read side ended", None);
            }
        }
    };

    lifecycle.begin_closing(cause).await;

    if let Some(frame) = close_frame {
        let _ = send_frame(&mut sink, WsMessage::Close(Some(frame)), config.write_timeout).await;
    }
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
}

async fn read_loop<R>(mut stream: R, lifecycle: &Lifecycle)
where
    R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut state = lifecycle.state.subscribe();

    let cause = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Close(_))) => break "peer closed",
                Some(Ok(WsMessage::Text(text))) => match Message::from_json(&text) {
                    Ok(message) => {
                        debug!(client_id = %lifecycle.id, kind = message.kind(), "Ignoring inbound message");
                    }
                    Err(e) => {
                        debug!(client_id = %lifecycle.id, "Ignoring inbound text frame: {}", e);
                    }
                },
                Some(Ok(WsMessage::Binary(data))) => {
                    debug!(client_id = %lifecycle.id, len = data.len(), "Ignoring inbound binary frame");
                }
                // Pings are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %lifecycle.id, "Read failed: {}", e);
                    break "read error";
                }
                None => break "stream ended",
            },
            _ = left_active(&mut state) => break "write side ended",
        }
    };

    lifecycle.begin_closing(cause).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig, HubStats};
    use crate::server::Message;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_hub(client_queue_capacity: usize) -> HubHandle {
        let (hub, handle) = Hub::new(HubConfig {
            intake_capacity: 64,
            client_queue_capacity,
        });
        tokio::spawn(hub.run());
        handle
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn connect(
        hub: &HubHandle,
        buffer: usize,
        config: ConnectionConfig,
    ) -> (
        ClientId,
        WebSocketStream<DuplexStream>,
        JoinHandle<ConnectionState>,
    ) {
        let (server_io, client_io) = tokio::io::duplex(buffer);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let connection = ClientConnection::accept(server_ws, peer(), hub.clone(), config)
            .await
            .unwrap();
        let id = connection.id();
        (id, client_ws, tokio::spawn(connection.run()))
    }

    async fn wait_for_stats(hub: &HubHandle, check: impl Fn(&HubStats) -> bool) -> HubStats {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let stats = hub.stats().await.unwrap();
                if check(&stats) {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn next_text(ws: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match frame {
                WsMessage::Text(text) => return text,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_written_to_socket() {
        let hub = spawn_hub(8);
        let (_, mut client, _task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;

        hub.broadcast(&Message::new("metrics_update", vec![1, 2]))
            .await
            .unwrap();

        assert_eq!(
            next_text(&mut client).await,
            r#"{"type":"metrics_update","data":[1,2]}"#
        );
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let hub = spawn_hub(8);
        let (id, mut client, task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;
        assert_eq!(hub.stats().await.unwrap().clients, vec![id]);

        client.close(None).await.unwrap();

        wait_for_stats(&hub, |stats| stats.clients.is_empty()).await;
        let state = tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_socket_unregisters() {
        let hub = spawn_hub(8);
        let (_, client, task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;

        drop(client);

        wait_for_stats(&hub, |stats| stats.clients.is_empty()).await;
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_application_frames_ignored() {
        let hub = spawn_hub(8);
        let (id, mut client, _task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;

        client
            .send(WsMessage::Text("hello".to_string()))
            .await
            .unwrap();
        client.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();

        hub.broadcast(&Message::new("tick", 1)).await.unwrap();
        assert_eq!(next_text(&mut client).await, r#"{"type":"tick","data":1}"#);
        assert_eq!(hub.stats().await.unwrap().clients, vec![id]);
    }

    #[tokio::test]
    async fn test_keepalive_ping_sent() {
        let hub = spawn_hub(8);
        let config = ConnectionConfig {
            ping_interval: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (_, mut client, _task) = connect(&hub, 64 * 1024, config).await;

        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Ping(_)));
    }

    #[tokio::test]
    async fn test_hub_shutdown_sends_close_frame() {
        let hub = spawn_hub(8);
        let (_, mut client, task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;

        hub.shutdown().await;

        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("Expected close frame, got {:?}", other),
        }
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hub_shutdown_flushes_queued_broadcast() {
        let hub = spawn_hub(8);
        let (_, mut client, task) = connect(&hub, 64 * 1024, ConnectionConfig::default()).await;

        hub.broadcast(&Message::new("metrics_update", vec![1]))
            .await
            .unwrap();
        hub.shutdown().await;

        assert_eq!(
            next_text(&mut client).await,
            r#"{"type":"metrics_update","data":[1]}"#
        );
        let frame = tokio::time::timeout(TIMEOUT, client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason, "server shutdown");
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_peer_evicted_and_closed() {
        let hub = spawn_hub(2);
        let config = ConnectionConfig {
            write_timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        };
        // The stalled client never reads and its transport buffer is tiny
        let (stalled_id, _stalled, stalled_task) = connect(&hub, 128, config).await;
        let (live_id, mut live, _live_task) = connect(&hub, 64 * 1024, config).await;

        let big = "x".repeat(1024);
        for _ in 0..8 {
            hub.broadcast(&Message::new("tick", &big)).await.unwrap();
            next_text(&mut live).await;
        }

        let stats = wait_for_stats(&hub, |stats| stats.evictions == 1).await;
        assert_eq!(stats.clients, vec![live_id]);
        assert!(!stats.clients.contains(&stalled_id));

        let state = tokio::time::timeout(TIMEOUT, stalled_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ConnectionState::Closed);

        hub.broadcast(&Message::new("after", 0)).await.unwrap();
        assert_eq!(next_text(&mut live).await, r#"{"type":"after","data":0}"#);
    }
}
