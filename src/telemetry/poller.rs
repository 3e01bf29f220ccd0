//! Telemetry poller
//!
//! Samples the container engine on a fixed interval and broadcasts each
//! snapshot through the hub as a `metrics_update` message. A failed sample
//! skips one tick; polling carries on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::ContainerLister;
use crate::hub::{HubError, HubHandle};
use crate::server::Message;

/// Default interval between samples
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Result of one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A snapshot was broadcast
    Broadcast { containers: usize },
    /// The sample failed; nothing was broadcast
    Skipped,
    /// The hub no longer accepts broadcasts
    HubClosed,
}

/// Counters kept by the poller
#[derive(Debug, Clone, Copy, Default)]
pub struct PollerStats {
    /// Ticks that produced a broadcast
    pub successes: u64,
    /// Ticks that were skipped
    pub failures: u64,
    /// When the last snapshot was broadcast
    pub last_success: Option<Instant>,
}

/// Periodic container snapshot producer
pub struct TelemetryPoller {
    lister: Arc<dyn ContainerLister>,
    hub: HubHandle,
    interval: Duration,
    stats: PollerStats,
}

impl TelemetryPoller {
    /// Create a poller sampling `lister` every `interval`
    pub fn new(lister: Arc<dyn ContainerLister>, hub: HubHandle, interval: Duration) -> Self {
        Self {
            lister,
            hub,
            interval,
            stats: PollerStats::default(),
        }
    }

    /// The fixed sampling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Counters so far
    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    /// Take one sample and broadcast it
    pub async fn tick(&mut self) -> TickOutcome {
        let containers = match self.lister.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                self.stats.failures += 1;
                error!(error = %e, "Failed to collect metrics");
                return TickOutcome::Skipped;
            }
        };

        let count = containers.len();
        match self.hub.broadcast(&Message::metrics_update(containers)).await {
            Ok(()) => {
                self.stats.successes += 1;
                self.stats.last_success = Some(Instant::now());
                debug!(containers = count, "Broadcast metrics update");
                TickOutcome::Broadcast { containers: count }
            }
            Err(HubError::Encode(e)) => {
                self.stats.failures += 1;
                error!(error = %e, "Failed to encode metrics update");
                TickOutcome::Skipped
            }
            Err(e) => {
                info!("Hub no longer accepts broadcasts: {}", e);
                TickOutcome::HubClosed
            }
        }
    }

    /// Tick until a shutdown signal arrives or the hub stops
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> PollerStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Telemetry poller started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await == TickOutcome::HubClosed {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping poller");
                    break;
                }
            }
        }

        info!(
            successes = self.stats.successes,
            failures = self.stats.failures,
            "Telemetry poller stopped"
        );
        self.stats
    }
}
