use crate::config::BackoffConfig;
use crate::error::{PlumberError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Identity document (`agent.json`) an agent process starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub token: String,
    pub server_addr: String,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlumberError::Configuration(format!(
                "failed to read agent config {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| {
            PlumberError::Configuration(format!("failed to parse agent config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Every field is required and `id` must be a UUID
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("id", &self.id),
            ("token", &self.token),
            ("server_addr", &self.server_addr),
        ] {
            if value.trim().is_empty() {
                return Err(PlumberError::Configuration(format!(
                    "agent {field} is required in config"
                )));
            }
        }
        self.agent_id()?;
        Ok(())
    }

    pub fn agent_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.id)
            .map_err(|e| PlumberError::Configuration(format!("invalid agent id in config: {e}")))
    }
}

/// Runtime knobs for [`AgentWorker`](super::AgentWorker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRuntimeConfig {
    /// Used when a step has no path
    pub work_dir: String,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    /// Retry policy for delivering a step result
    pub report_backoff: BackoffConfig,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: "/tmp".to_string(),
            heartbeat_interval_ms: 1_000,
            poll_interval_ms: 500,
            command_timeout_ms: 600_000,
            report_backoff: BackoffConfig {
                max_attempts: 5,
                ..BackoffConfig::default()
            },
        }
    }
}

impl AgentRuntimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
