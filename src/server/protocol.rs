//! Protocol message definitions
//!
//! Defines the messages pushed from the hub to dashboard clients.
//! Every message is a JSON object `{"type": ..., "data": ...}` encoded once
//! and shared by all recipients.

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::engine::ContainerInfo;

/// Message type for periodic container snapshots
pub const METRICS_UPDATE: &str = "metrics_update";

/// Maximum length of a message type tag
pub const MAX_TYPE_LENGTH: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message
// ============================================================================

/// A message encoded to its wire form.
///
/// Cloning only bumps a reference count, so one encoding can sit in many
/// client queues at once.
pub type EncodedMessage = Arc<str>;

/// A unit of broadcast data: a type tag and a payload
///
/// Fields are private; a message never changes after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message<T = serde_json::Value> {
    #[serde(rename = "type")]
    kind: String,
    data: T,
}

impl<T> Message<T> {
    /// Create a message with the given type tag and payload
    pub fn new(kind: impl Into<String>, data: T) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// The message type tag
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl<T: Serialize> Message<T> {
    /// Validate the type tag
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.kind.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "type cannot be empty".to_string(),
            ));
        }
        if self.kind.len() > MAX_TYPE_LENGTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "type exceeds maximum length of {} characters",
                MAX_TYPE_LENGTH
            )));
        }
        Ok(())
    }

    /// Encode the message to its wire form
    pub fn encode(&self) -> ProtocolResult<EncodedMessage> {
        self.validate()?;
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

impl Message<Vec<ContainerInfo>> {
    /// Create a `metrics_update` message carrying a container snapshot
    pub fn metrics_update(containers: Vec<ContainerInfo>) -> Self {
        Self::new(METRICS_UPDATE, containers)
    }
}

impl Message {
    /// Parse and validate a message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }
}

// ============================================================================
// Close Reasons
// ============================================================================

/// Why the server is closing a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client's outbound queue overflowed
    Backpressure,
    /// The hub is shutting down
    ServerShutdown,
}

impl CloseReason {
    /// Whether messages already queued for the client are still written
    /// before the close frame
    pub fn drains_queue(self) -> bool {
        matches!(self, CloseReason::ServerShutdown)
    }

    /// Close frame sent to the peer for this reason
    pub fn close_frame(self) -> CloseFrame<'static> {
        let (code, reason) = match self {
            CloseReason::Backpressure => (CloseCode::Policy, "backpressure"),
            CloseReason::ServerShutdown => (CloseCode::Away, "server shutdown"),
        };
        CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
