//! Container lister seam
//!
//! The poller only needs "give me the current containers". Anything that can
//! answer that implements [`ContainerLister`].

use async_trait::async_trait;
use thiserror::Error;

use super::ContainerInfo;

/// Errors that can occur while querying the container engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to run engine command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Engine command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Engine command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Failed to parse engine output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Source of container snapshots
#[async_trait]
pub trait ContainerLister: Send + Sync {
    /// List all containers, running or not
    async fn list_containers(&self) -> EngineResult<Vec<ContainerInfo>>;
}
