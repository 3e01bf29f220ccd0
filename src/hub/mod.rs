//! Telemetry hub module
//!
//! Keeps the registry of live dashboard clients and fans broadcast messages
//! out to their outbound queues.

mod client;
mod registry;

pub use client::*;
pub use registry::*;
