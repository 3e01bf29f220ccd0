//! Connection registry and fan-out loop
//!
//! The [`Hub`] owns the set of live clients. Every change to that set and
//! every broadcast goes through a single intake queue that [`Hub::run`]
//! drains in order, so registry mutations and fan-out never race.
//! Collaborators talk to the loop through a cloneable [`HubHandle`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::{client_channel, ClientHandle, ClientId, ClientMailbox, Enqueue};
use crate::server::{CloseReason, EncodedMessage, Message, ProtocolError};

/// Default capacity of the hub's intake queue
pub const DEFAULT_INTAKE_CAPACITY: usize = 256;

/// Default capacity of each client's outbound queue
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 32;

/// Errors returned by hub operations
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Hub has stopped")]
    Stopped,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Hub lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    /// Accepting registrations and broadcasts
    Running,
    /// Refusing registrations, finishing queued work
    Draining,
    /// Loop has exited; terminal
    Stopped,
}

/// Point-in-time view of the hub
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubStats {
    /// Current lifecycle state
    pub state: HubState,
    /// IDs of live clients, sorted
    pub clients: Vec<ClientId>,
    /// Broadcasts fanned out since start
    pub broadcasts: u64,
    /// Clients evicted for backpressure since start
    pub evictions: u64,
}

/// Hub sizing
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Capacity of the intake queue
    pub intake_capacity: usize,
    /// Capacity of each client's outbound queue
    pub client_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

/// Requests processed by the hub loop
#[derive(Debug)]
enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(EncodedMessage),
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

/// Single-writer owner of the live client set
pub struct Hub {
    /// Live clients; only touched by the loop
    clients: HashMap<ClientId, ClientHandle>,
    /// Intake queue shared by all handles
    intake: mpsc::Receiver<HubCommand>,
    /// Lifecycle state published to handles
    state_tx: watch::Sender<HubState>,
    broadcasts: u64,
    evictions: u64,
}

impl Hub {
    /// Create a hub and the handle collaborators use to reach it
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(HubState::Running);

        let hub = Self {
            clients: HashMap::new(),
            intake: intake_rx,
            state_tx,
            broadcasts: 0,
            evictions: 0,
        };
        let handle = HubHandle {
            intake: intake_tx,
            state: state_rx,
            client_queue_capacity: config.client_queue_capacity,
        };

        (hub, handle)
    }

    /// Run the control loop until shutdown.
    ///
    /// The loop ends when a shutdown request has been drained or when every
    /// handle has been dropped. Remaining clients are closed on the way out.
    pub async fn run(mut self) {
        info!("Telemetry hub running");

        while let Some(command) = self.intake.recv().await {
            self.handle(command);
        }

        let remaining = self.clients.len();
        for (_, client) in self.clients.drain() {
            client.close(CloseReason::ServerShutdown);
        }
        self.state_tx.send_replace(HubState::Stopped);

        info!(
            closed = remaining,
            broadcasts = self.broadcasts,
            evictions = self.evictions,
            "Telemetry hub stopped"
        );
    }

    fn state(&self) -> HubState {
        *self.state_tx.borrow()
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => self.register(client),
            HubCommand::Unregister(id) => self.unregister(id),
            HubCommand::Broadcast(payload) => self.fan_out(&payload),
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            HubCommand::Shutdown => self.begin_draining(),
        }
    }

    fn register(&mut self, client: ClientHandle) {
        let id = client.id();

        if self.state() != HubState::Running {
            debug!(client_id = %id, "Registration refused, hub is draining");
            client.close(CloseReason::ServerShutdown);
            return;
        }
        if client.is_closed() {
            debug!(client_id = %id, "Client went away before registration");
            return;
        }
        if self.clients.contains_key(&id) {
            warn!(client_id = %id, "Duplicate registration ignored");
            return;
        }

        self.clients.insert(id, client);
        debug!(client_id = %id, live = self.clients.len(), "Client registered");
    }

    fn unregister(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            debug!(client_id = %id, live = self.clients.len(), "Client unregistered");
        }
    }

    fn fan_out(&mut self, payload: &EncodedMessage) {
        self.broadcasts += 1;

        let mut dropped = Vec::new();
        for (id, client) in &self.clients {
            match client.try_enqueue(payload) {
                Enqueue::Queued => {}
                Enqueue::Full => dropped.push((*id, true)),
                Enqueue::Closed => dropped.push((*id, false)),
            }
        }

        for (id, overflowed) in dropped {
            let Some(client) = self.clients.remove(&id) else {
                continue;
            };
            if overflowed {
                self.evictions += 1;
                warn!(client_id = %id, "Client outbound queue full, evicting");
                client.close(CloseReason::Backpressure);
            } else {
                debug!(client_id = %id, "Client queue closed, removing");
            }
        }
    }

    fn begin_draining(&mut self) {
        if self.state() == HubState::Running {
            info!(live = self.clients.len(), "Telemetry hub draining");
            self.state_tx.send_replace(HubState::Draining);
            self.intake.close();
        }
    }

    fn stats(&self) -> HubStats {
        let mut clients: Vec<ClientId> = self.clients.keys().copied().collect();
        clients.sort();
        HubStats {
            state: self.state(),
            clients,
            broadcasts: self.broadcasts,
            evictions: self.evictions,
        }
    }
}

/// Cloneable handle to a running hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    intake: mpsc::Sender<HubCommand>,
    state: watch::Receiver<HubState>,
    client_queue_capacity: usize,
}

impl HubHandle {
    /// Current hub state
    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    /// Create a client queue sized for this hub
    pub fn client_channel(&self) -> (ClientHandle, ClientMailbox) {
        client_channel(self.client_queue_capacity)
    }

    /// Add a client to the live set.
    ///
    /// If the hub no longer accepts registrations the client is told to
    /// close and an error is returned.
    pub async fn register(&self, client: ClientHandle) -> HubResult<()> {
        if self.state() != HubState::Running {
            client.close(CloseReason::ServerShutdown);
            return Err(self.closed_error());
        }

        match self.intake.send(HubCommand::Register(client)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(command)) => {
                if let HubCommand::Register(client) = command {
                    client.close(CloseReason::ServerShutdown);
                }
                Err(self.closed_error())
            }
        }
    }

    /// Remove a client from the live set. Unknown IDs, repeated calls, and
    /// calls after shutdown are all no-ops.
    pub async fn unregister(&self, id: ClientId) {
        let _ = self.intake.send(HubCommand::Unregister(id)).await;
    }

    /// Encode a message once and fan it out to every live client
    pub async fn broadcast<T: Serialize>(&self, message: &Message<T>) -> HubResult<()> {
        let payload = message.encode()?;
        self.broadcast_encoded(payload).await
    }

    /// Fan out an already encoded message
    pub async fn broadcast_encoded(&self, payload: EncodedMessage) -> HubResult<()> {
        self.intake
            .send(HubCommand::Broadcast(payload))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Snapshot of the hub, ordered with respect to earlier requests
    pub async fn stats(&self) -> HubResult<HubStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intake
            .send(HubCommand::Stats(reply_tx))
            .await
            .map_err(|_| self.closed_error())?;
        reply_rx.await.map_err(|_| self.closed_error())
    }

    /// Stop the hub and wait until it has closed every client.
    ///
    /// Safe to call more than once and from several handles.
    pub async fn shutdown(&self) {
        let _ = self.intake.send(HubCommand::Shutdown).await;
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == HubState::Stopped).await;
    }

    fn closed_error(&self) -> HubError {
        match self.state() {
            HubState::Stopped => HubError::Stopped,
            _ => HubError::ShuttingDown,
        }
    }
}
