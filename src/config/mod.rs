//! # Plumber Configuration
//!
//! Typed configuration for the engine. Values come from built-in defaults,
//! optional TOML files and `PLUMBER__<SECTION>__<KEY>` environment variables;
//! see [`ConfigManager`] for the merge order.
//!
//! ```rust,no_run
//! use plumber_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let sweep = manager.config().liveness.sweep_interval();
//! let step_timeout = manager.config().orchestrator.step_timeout();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use crate::error::{PlumberError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/plumber.toml`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PlumberConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub liveness: LivenessConfig,
    pub orchestrator: OrchestratorConfig,
    pub backoff: BackoffConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/plumber".to_string(),
            max_connections: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Step assignment settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on steps claimed by one scheduler call
    pub claim_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { claim_limit: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub sweep_interval_ms: u64,
    /// Agents silent for longer than this are marked offline
    pub heartbeat_timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
        }
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub step_timeout_ms: u64,
    pub step_poll_interval_ms: u64,
    /// Re-adopt executions left `running` by a previous process
    pub recover_on_startup: bool,
    pub list_executions_limit: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 600_000,
            step_poll_interval_ms: 2_000,
            recover_on_startup: true,
            list_executions_limit: 20,
        }
    }
}

impl OrchestratorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn step_poll_interval(&self) -> Duration {
        Duration::from_millis(self.step_poll_interval_ms)
    }
}

/// Retry policy for non-critical storage calls
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Values rendered into agent configuration documents
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `server_addr` handed to agents
    pub export_endpoint: String,
    pub agent_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            export_endpoint: "http://127.0.0.1:52181".to_string(),
            agent_token: String::new(),
        }
    }
}

impl PlumberConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.claim_limit == 0 {
            return Err(PlumberError::Configuration(
                "scheduler.claim_limit must be at least 1".to_string(),
            ));
        }
        if self.liveness.sweep_interval_ms == 0 || self.orchestrator.step_poll_interval_ms == 0 {
            return Err(PlumberError::Configuration(
                "sweep and poll intervals must be non-zero".to_string(),
            ));
        }
        if self.liveness.heartbeat_timeout_ms <= self.liveness.sweep_interval_ms {
            return Err(PlumberError::Configuration(format!(
                "liveness.heartbeat_timeout_ms ({}) must exceed liveness.sweep_interval_ms ({})",
                self.liveness.heartbeat_timeout_ms, self.liveness.sweep_interval_ms
            )));
        }
        if self.orchestrator.step_timeout_ms < self.orchestrator.step_poll_interval_ms {
            return Err(PlumberError::Configuration(
                "orchestrator.step_timeout_ms must not be shorter than the poll interval"
                    .to_string(),
            ));
        }
        if self.backoff.max_attempts == 0 || self.backoff.multiplier < 1.0 {
            return Err(PlumberError::Configuration(
                "backoff.max_attempts must be >= 1 and backoff.multiplier >= 1.0".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(PlumberError::Configuration(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
