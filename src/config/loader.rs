//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are merged
//! in order, later ones winning:
//!
//! 1. Built-in defaults (`#[serde(default)]` on every section)
//! 2. `{config_dir}/reelforge.toml`
//! 3. `{config_dir}/reelforge.{environment}.toml`
//! 4. Environment variables `REELFORGE_<SECTION>__<KEY>`, e.g.
//!    `REELFORGE_EXECUTION__MAX_CONCURRENT_TASKS=4`
//!
//! Missing files are not an error; invalid values are.

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use ::config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const CONFIG_FILE_STEM: &str = "reelforge";
pub const ENV_PREFIX: &str = "REELFORGE";

#[derive(Debug)]
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection from `./config`
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_prefix(config_dir, environment, ENV_PREFIX)
    }

    /// Load with an explicit environment-variable prefix. Tests use a unique
    /// prefix so they do not observe each other's variables.
    pub fn load_with_prefix(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_prefix: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading orchestrator configuration"
        );

        let base = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let overlay = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        let merged = Config::builder()
            .add_source(Self::toml_file(&base))
            .add_source(Self::toml_file(&overlay))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(base.display().to_string(), e))?;

        let config: OrchestratorConfig = merged
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(base.display().to_string(), e))?;
        config.validate()?;

        info!(
            environment = %environment,
            max_concurrent_tasks = config.execution.max_concurrent_tasks,
            store_backend = ?config.state_store.backend,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Parse configuration from a TOML string with no other sources
    pub fn from_toml_str(content: &str) -> ConfigResult<OrchestratorConfig> {
        let config: OrchestratorConfig = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Sanitized view for logging; the sqlite url may embed credentials-like paths
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or_default();
        if let Some(url) = value.pointer_mut("/state_store/url") {
            *url = serde_json::Value::String("***".to_string());
        }
        value
    }

    fn toml_file(path: &Path) -> File<::config::FileSourceFile, FileFormat> {
        File::from(path).format(FileFormat::Toml).required(false)
    }

    fn detect_environment() -> String {
        env::var("REELFORGE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::models::TaskKind;
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = r#"
[execution]
max_concurrent_tasks = 6
generation_timeout_ms = 120000

[backoff]
base_delay_ms = 500
default_retry_budget = 2

[backoff.retry_budgets]
generate-subclip = 4

[resource_limits]
generation = 2
"#;

    fn setup_config_dir(overlay: Option<(&str, &str)>) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("reelforge.toml"), BASE).unwrap();
        if let Some((environment, content)) = overlay {
            fs::write(
                dir.path().join(format!("reelforge.{environment}.toml")),
                content,
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn test_basic_config_loading() {
        let dir = setup_config_dir(None);
        let manager = ConfigManager::load_with_prefix(
            Some(dir.path().to_path_buf()),
            "development",
            "REELFORGE_TEST_BASIC",
        )
        .unwrap();
        let config = manager.config();

        assert_eq!(config.execution.max_concurrent_tasks, 6);
        assert_eq!(config.execution.generation_timeout_ms, 120_000);
        // Unset fields keep their defaults
        assert_eq!(config.execution.metadata_timeout_ms, 30_000);
        assert_eq!(config.backoff.base_delay_ms, 500);
        assert_eq!(config.backoff.retry_budget_for(TaskKind::GenerateSubclip), 4);
        assert_eq!(config.backoff.retry_budget_for(TaskKind::CollectAssets), 2);
        assert_eq!(config.resource_limits.generation, 2);
        assert_eq!(config.resource_limits.local_media, 2);
        assert_eq!(manager.environment(), "development");
    }

    #[test]
    fn test_environment_specific_overrides() {
        let dir = setup_config_dir(Some((
            "test",
            "[execution]\nmax_concurrent_tasks = 2\n\n[state_store]\nbackend = \"sqlite\"\nurl = \"sqlite::memory:\"\n",
        )));
        let manager =
            ConfigManager::load_with_prefix(Some(dir.path().to_path_buf()), "test", "REELFORGE_TEST_OVERLAY")
                .unwrap();

        assert_eq!(manager.config().execution.max_concurrent_tasks, 2);
        assert_eq!(manager.config().execution.generation_timeout_ms, 120_000);
        assert_eq!(manager.config().state_store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_environment_variable_overrides() {
        let dir = setup_config_dir(None);
        env::set_var("REELFORGE_TEST_ENVVAR_EXECUTION__MAX_CONCURRENT_TASKS", "3");
        let manager = ConfigManager::load_with_prefix(
            Some(dir.path().to_path_buf()),
            "development",
            "REELFORGE_TEST_ENVVAR",
        )
        .unwrap();
        env::remove_var("REELFORGE_TEST_ENVVAR_EXECUTION__MAX_CONCURRENT_TASKS");

        assert_eq!(manager.config().execution.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_missing_directory_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::load_with_prefix(
            Some(dir.path().join("absent")),
            "production",
            "REELFORGE_TEST_MISSING",
        )
        .unwrap();
        assert_eq!(manager.config(), &OrchestratorConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let result = ConfigManager::from_toml_str("[resource_limits]\nlocal_media = 0\n");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));

        let result = ConfigManager::from_toml_str("[execution]\nmax_concurrent_tasks = \"many\"\n");
        assert!(matches!(result, Err(ConfigurationError::LoadError { .. })));
    }

    #[test]
    fn test_debug_config_masks_store_url() {
        let dir = setup_config_dir(None);
        let manager = ConfigManager::load_with_prefix(
            Some(dir.path().to_path_buf()),
            "development",
            "REELFORGE_TEST_DEBUG",
        )
        .unwrap();
        assert_eq!(manager.debug_config()["state_store"]["url"], "***");
    }
}
