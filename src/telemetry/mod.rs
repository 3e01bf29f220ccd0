//! Telemetry module
//!
//! Background sampling of container state for the dashboard.

mod poller;

pub use poller::*;
