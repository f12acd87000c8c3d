//! Runtime configuration.
//!
//! Every knob has a default, so a zero-config `RuntimeConfig::default()` is
//! fully usable; TOML loading exists for deployments that want a file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::CapabilityRouter;
use crate::executor::ExecutorConfig;
use crate::planner::PlannerConfig;
use crate::queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    /// Default timeout applied to capability invocations that carry none.
    pub capability_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            capability_timeout_ms: CapabilityRouter::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
