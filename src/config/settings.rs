//! Service settings
//!
//! Loads the hub's configuration from a TOML file. Every field has a default,
//! so a missing file or a partial file is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{DockerCli, EngineResult, DEFAULT_COMMAND_TIMEOUT};
use crate::hub::{HubConfig, DEFAULT_CLIENT_QUEUE_CAPACITY, DEFAULT_INTAKE_CAPACITY};
use crate::server::{
    ConnectionConfig, ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CLIENTS,
    DEFAULT_PING_INTERVAL, DEFAULT_WRITE_TIMEOUT, DEFAULT_WS_PATH,
};
use crate::telemetry::DEFAULT_POLL_INTERVAL;

/// Configuration file looked up when none is given
pub const DEFAULT_CONFIG_FILE: &str = "cyber-hub.toml";

/// Upper bound for every interval and timeout setting (one day)
pub const MAX_DURATION_SECS: u64 = 86_400;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Upgrade path
    pub path: String,
    /// Maximum simultaneous connections
    pub max_clients: usize,
    /// Seconds a peer gets to finish the upgrade
    pub handshake_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8081,
            path: DEFAULT_WS_PATH.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        }
    }
}

/// Hub queue sizes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    pub intake_capacity: usize,
    pub client_queue_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

/// Per-connection timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: DEFAULT_PING_INTERVAL.as_secs(),
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT.as_secs(),
        }
    }
}

/// Poller settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub poll_interval_secs: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
        }
    }
}

/// Container engine access
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Program and leading arguments, e.g. `["docker"]` or `["podman"]`
    pub command: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            command: vec!["docker".to_string()],
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub client: ClientSettings,
    pub telemetry: TelemetrySettings,
    pub engine: EngineSettings,
}

impl Settings {
    /// Load settings from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("server.max_clients", self.server.max_clients),
            ("hub.intake_capacity", self.hub.intake_capacity),
            ("hub.client_queue_capacity", self.hub.client_queue_capacity),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }

        let durations = [
            ("server.handshake_timeout_secs", self.server.handshake_timeout_secs),
            ("client.ping_interval_secs", self.client.ping_interval_secs),
            ("client.write_timeout_secs", self.client.write_timeout_secs),
            ("telemetry.poll_interval_secs", self.telemetry.poll_interval_secs),
            ("engine.command_timeout_secs", self.engine.command_timeout_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_DURATION_SECS, secs
                )));
            }
        }

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }
        if self.engine.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::Invalid(
                "engine.command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Upgrade endpoint configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.server.bind.clone(), self.server.port)
            .with_path(self.server.path.clone())
            .with_max_clients(self.server.max_clients)
            .with_handshake_timeout(Duration::from_secs(self.server.handshake_timeout_secs))
            .with_connection(self.connection_config())
    }

    /// Hub sizing
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            intake_capacity: self.hub.intake_capacity,
            client_queue_capacity: self.hub.client_queue_capacity,
        }
    }

    /// Per-connection timing
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            ping_interval: Duration::from_secs(self.client.ping_interval_secs),
            write_timeout: Duration::from_secs(self.client.write_timeout_secs),
        }
    }

    /// Poller interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.poll_interval_secs)
    }

    /// Container lister for the configured engine command
    pub fn docker_cli(&self) -> EngineResult<DockerCli> {
        Ok(DockerCli::new(self.engine.command.clone())?
            .with_timeout(Duration::from_secs(self.engine.command_timeout_secs)))
    }
}
