//! # Orchestrator Configuration
//!
//! Typed configuration for the scheduler, retry policy, resource gates and
//! state store. Every section has defaults, so an orchestrator can be built
//! without any file; [`ConfigManager`] layers a TOML file, an environment
//! overlay file and `REELFORGE_*` environment variables on top.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reelforge_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let limit = manager.config().execution.max_concurrent_tasks;
//! let generation_timeout = manager.config().execution.generation_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::models::{ResourceClass, TaskKind, TimeoutProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub execution: ExecutionConfig,
    pub backoff: BackoffConfig,
    pub resource_limits: ResourceLimitsConfig,
    pub state_store: StateStoreConfig,
    pub events: EventsConfig,
    pub pipeline: PipelineConfig,
}

/// Dispatch bounds and per-profile timeouts
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker-pool bound across all resource classes
    pub max_concurrent_tasks: usize,
    /// Re-evaluation interval while ready work waits on a resource gate
    pub scheduler_tick_ms: u64,
    pub metadata_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub media_timeout_ms: u64,
    /// Poll cadence for outstanding generation handles
    pub generation_poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            scheduler_tick_ms: 250,
            metadata_timeout_ms: 30_000,
            generation_timeout_ms: 900_000,
            media_timeout_ms: 300_000,
            generation_poll_interval_ms: 2_000,
        }
    }
}

impl ExecutionConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn generation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.generation_poll_interval_ms)
    }

    pub fn timeout_for(&self, profile: TimeoutProfile) -> Duration {
        let millis = match profile {
            TimeoutProfile::Metadata => self.metadata_timeout_ms,
            TimeoutProfile::Generation => self.generation_timeout_ms,
            TimeoutProfile::LocalMedia => self.media_timeout_ms,
        };
        Duration::from_millis(millis)
    }
}

/// Exponential backoff and retry budgets
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay, including server-requested ones
    pub max_delay_ms: u64,
    /// Retries after the first attempt
    pub default_retry_budget: u32,
    /// Per-kind overrides of the retry budget
    pub retry_budgets: HashMap<TaskKind, u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            default_retry_budget: 2,
            retry_budgets: HashMap::new(),
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retry_budget_for(&self, kind: TaskKind) -> u32 {
        self.retry_budgets
            .get(&kind)
            .copied()
            .unwrap_or(self.default_retry_budget)
    }
}

/// Concurrent dispatch limit per resource class
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub generation: usize,
    pub interpretation: usize,
    pub storage_io: usize,
    pub local_media: usize,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            generation: 3,
            interpretation: 2,
            storage_io: 8,
            local_media: 2,
        }
    }
}

impl ResourceLimitsConfig {
    pub fn limit_for(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::Generation => self.generation,
            ResourceClass::Interpretation => self.interpretation,
            ResourceClass::StorageIo => self.storage_io,
            ResourceClass::LocalMedia => self.local_media,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StateStoreConfig {
    pub backend: StoreBackend,
    /// SQLite connection url, ignored by the memory backend
    pub url: String,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "sqlite://reelforge.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on scene pairs a brief may fan out into
    pub max_scenes: usize,
    pub subclip_duration_seconds: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_scenes: 12,
            subclip_duration_seconds: 4.0,
        }
    }
}

impl OrchestratorConfig {
    /// Validate cross-field constraints after loading
    pub fn validate(&self) -> ConfigResult<()> {
        if self.execution.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_tasks",
                0,
                "must allow at least one task in flight",
            ));
        }
        if self.execution.scheduler_tick_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.scheduler_tick_ms",
                0,
                "must be positive",
            ));
        }
        for class in ResourceClass::ALL {
            if self.resource_limits.limit_for(class) == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("resource_limits.{class}"),
                    0,
                    "a zero limit would never dispatch tasks of this class",
                ));
            }
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_ms",
                self.backoff.base_delay_ms,
                format!("exceeds backoff.max_delay_ms ({})", self.backoff.max_delay_ms),
            ));
        }
        if self.state_store.backend == StoreBackend::Sqlite && self.state_store.url.trim().is_empty()
        {
            return Err(ConfigurationError::invalid_value(
                "state_store.url",
                "",
                "required for the sqlite backend",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "must be positive",
            ));
        }
        if self.pipeline.max_scenes == 0 {
            return Err(ConfigurationError::invalid_value(
                "pipeline.max_scenes",
                0,
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff.default_retry_budget, 2);
        assert_eq!(config.backoff.retry_budget_for(TaskKind::GenerateSubclip), 2);
    }

    #[test]
    fn test_timeout_profiles() {
        let execution = ExecutionConfig::default();
        assert!(
            execution.timeout_for(TimeoutProfile::Metadata)
                < execution.timeout_for(TimeoutProfile::Generation)
        );
        assert_eq!(
            execution.timeout_for(TimeoutProfile::LocalMedia),
            Duration::from_millis(execution.media_timeout_ms)
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = OrchestratorConfig::default();
        config.resource_limits.generation = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field, .. }) if field == "resource_limits.generation"
        ));

        let mut config = OrchestratorConfig::default();
        config.backoff.base_delay_ms = 10_000;
        config.backoff.max_delay_ms = 5_000;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.state_store.backend = StoreBackend::Sqlite;
        config.state_store.url = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_budget_override() {
        let mut backoff = BackoffConfig::default();
        backoff.retry_budgets.insert(TaskKind::StoreFinal, 5);
        assert_eq!(backoff.retry_budget_for(TaskKind::StoreFinal), 5);
        assert_eq!(backoff.retry_budget_for(TaskKind::CombineClips), 2);
    }
}
