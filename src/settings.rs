//! Process settings.
//!
//! A node process reads its identity and ambient knobs from a TOML file
//! merged with environment variables prefixed `RUNDAQ_` (nested keys use a
//! double underscore, e.g. `RUNDAQ_LOGGING__LEVEL=debug`). Run configuration
//! is not part of this: it arrives as TOML text with every Configure command.
//!
//! ```toml
//! [node]
//! name = "mock0"
//! kind = "producer"
//! type_name = "MockProducer"
//! run_control = "127.0.0.1:44000"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [transport]
//! event_queue_capacity = 4096
//! ```

use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "RUNDAQ_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub node: NodeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Producer,
    Collector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Component name, unique within the DAQ system.
    pub name: String,
    pub kind: NodeKind,
    /// Registered producer or collector type.
    pub type_name: String,
    /// `host:port` of run control; the node runs standalone when unset.
    #[serde(default)]
    pub run_control: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

/// Data path sizing shared by producers and collectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Bound of every event queue on the data path.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// How long a collector waits for outstanding end-of-run markers on stop.
    #[serde(default = "default_stop_drain_timeout")]
    pub stop_drain_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            stop_drain_timeout_ms: default_stop_drain_timeout(),
        }
    }
}

impl TransportSettings {
    pub fn stop_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_drain_timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    daq_core::codec::DEFAULT_MAX_FRAME
}

fn default_stop_drain_timeout() -> u64 {
    5000
}

impl Settings {
    /// Load `path` merged with `RUNDAQ_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Serialized::default("logging", LoggingSettings::default()))
            .merge(Serialized::default("transport", TransportSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate, for use at process start.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let settings = Self::load_from(path.as_ref())
            .map_err(|e| anyhow::anyhow!("loading {}: {}", path.as_ref().display(), e))?;
        settings.validate().map_err(anyhow::Error::msg)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.node.name.trim().is_empty() {
            return Err("node.name must not be empty".to_string());
        }
        if self.node.name.contains(['.', ',', '=']) {
            return Err(format!(
                "node.name '{}' must not contain '.', ',' or '='",
                self.node.name
            ));
        }
        if self.node.type_name.trim().is_empty() {
            return Err("node.type_name must not be empty".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.transport.event_queue_capacity == 0 {
            return Err("transport.event_queue_capacity must be positive".to_string());
        }
        if self.transport.max_frame_bytes < 1024 {
            return Err(format!(
                "transport.max_frame_bytes {} is too small",
                self.transport.max_frame_bytes
            ));
        }
        Ok(())
    }
}
