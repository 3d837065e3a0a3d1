//! Node configuration types.
//!
//! Every section has defaults so a config file only needs to name what it
//! changes. `NodeConfig::validate` rejects values the node cannot run with.

use crate::error::HolonetError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for one node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's registry key.
    pub node_name: String,
    /// Registry key of the mandatory upstream peer.
    pub upstream_peer: String,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub tick: TickConfig,
    pub reconnect: ReconnectConfig,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "chat".to_string(),
            upstream_peer: "connection".to_string(),
            network: NetworkConfig::default(),
            database: DatabaseConfig::default(),
            tick: TickConfig::default(),
            reconnect: ReconnectConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Listener and link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub bind_address: String,
    /// Port the listener binds to (0 picks a free port).
    pub bind_port: u16,
    /// Address published in the registry. Defaults to the bound address.
    pub advertise_address: Option<String>,
    /// Largest accepted frame (opcode + payload) in bytes.
    pub max_frame_size: u32,
    /// Timeout for the mandatory startup connect.
    pub connect_timeout_secs: u64,
    /// Frames drained per link per tick.
    pub frames_per_link: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 5000,
            advertise_address: None,
            max_frame_size: 8 * 1024 * 1024,
            connect_timeout_secs: 10,
            frames_per_link: 32,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding the process registry.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("holonet.db"),
        }
    }
}

/// Heartbeat interval used when the config file does not set one.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 180;

/// Main loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Pause between iterations.
    pub interval_ms: u64,
    /// Interval between heartbeat log lines.
    pub heartbeat_interval_secs: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Backoff for runtime reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0.0 = no jitter, 1.0 = up to double the delay.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

/// Console and file log levels ("error" .. "trace").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub console_level: String,
    pub file_level: String,
    pub file: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file_level: "info".to_string(),
            file: PathBuf::from("chat_server.log"),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl NodeConfig {
    /// Reject configurations the node cannot start with.
    pub fn validate(&self) -> Result<(), HolonetError> {
        if self.node_name.trim().is_empty() {
            return Err(HolonetError::Configuration("node_name is empty".into()));
        }
        if self.upstream_peer.trim().is_empty() {
            return Err(HolonetError::Configuration("upstream_peer is empty".into()));
        }
        if self.upstream_peer == self.node_name {
            return Err(HolonetError::Configuration(format!(
                "node '{}' cannot be its own upstream peer",
                self.node_name
            )));
        }
        if self.tick.interval_ms == 0 {
            return Err(HolonetError::Configuration(
                "tick.interval_ms must be at least 1".into(),
            ));
        }
        if self.tick.heartbeat_interval_secs == 0 {
            return Err(HolonetError::Configuration(
                "tick.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.network.frames_per_link == 0 {
            return Err(HolonetError::Configuration(
                "network.frames_per_link must be at least 1".into(),
            ));
        }
        if self.network.max_frame_size < 4 {
            return Err(HolonetError::Configuration(
                "network.max_frame_size must fit an opcode".into(),
            ));
        }
        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            return Err(HolonetError::Configuration(
                "reconnect.min_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(HolonetError::Configuration(format!(
                "reconnect.jitter {} is outside 0.0..=1.0",
                self.reconnect.jitter
            )));
        }
        for (key, level) in [
            ("log.console_level", &self.log.console_level),
            ("log.file_level", &self.log.file_level),
        ] {
            if !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(HolonetError::Configuration(format!(
                    "{key} '{level}' is not one of {LOG_LEVELS:?}"
                )));
            }
        }
        Ok(())
    }
}
