//! Engine configuration, loadable from YAML with every field defaulted.

use crate::api::RunMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid yaml: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Tunables of the telemetry engine. Metric thresholds and the trend
/// deadband are fixed constants and deliberately absent here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the run service API, e.g. "https://evac.example.org/api".
    pub base_url: String,
    /// Engine identifier an artifact must carry to be served.
    pub engine_tag: String,
    /// Background refresh period of the run list.
    pub poll_interval_secs: u64,
    /// Ceiling for cheap status and list requests.
    pub status_timeout_secs: u64,
    /// Ceiling for authoritative artifact computation.
    pub compute_timeout_secs: u64,
    /// Progress silence ceiling for quick runs.
    pub quick_run_timeout_secs: u64,
    /// Progress silence ceiling for full planning runs.
    pub full_run_timeout_secs: u64,
    /// Capacity of the serialized update queue.
    pub update_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            engine_tag: "behavioral-v2".to_string(),
            poll_interval_secs: 30,
            status_timeout_secs: 10,
            compute_timeout_secs: 300,
            quick_run_timeout_secs: 60,
            full_run_timeout_secs: 600,
            update_queue_depth: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty"));
        }
        if self.engine_tag.trim().is_empty() {
            return Err(ConfigError::Invalid("engine_tag must not be empty"));
        }
        if self.poll_interval_secs == 0
            || self.status_timeout_secs == 0
            || self.compute_timeout_secs == 0
            || self.quick_run_timeout_secs == 0
            || self.full_run_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("durations must be > 0"));
        }
        if self.update_queue_depth == 0 {
            return Err(ConfigError::Invalid("update_queue_depth must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs)
    }

    /// Progress silence ceiling for a run of the given mode.
    pub fn run_timeout(&self, mode: RunMode) -> Duration {
        match mode {
            RunMode::Quick => Duration::from_secs(self.quick_run_timeout_secs),
            RunMode::Full => Duration::from_secs(self.full_run_timeout_secs),
        }
    }
}
