//! WebSocket server module
//!
//! Accepts dashboard clients on the upgrade endpoint and runs one
//! connection handler per client.

mod handler;
mod protocol;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
