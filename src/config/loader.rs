//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate, later sources overriding earlier ones:
//!
//! 1. built-in defaults (`TaskerConfig::default()`)
//! 2. `{config_dir}/tasker-config.yaml` (optional)
//! 3. `{config_dir}/tasker-config-{environment}.yaml` (optional)
//! 4. `TASKER_*` environment variables, `__` separating nested keys
//!    (`TASKER_EXECUTION__MAX_CONCURRENT_STEPS=4`)

use super::error::{ConfigResult, ConfigurationError};
use super::TaskerConfig;
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_CONFIG_FILE: &str = "tasker-config.yaml";
const ENV_PREFIX: &str = "TASKER";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: TaskerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, None)
    }

    /// Load configuration with an explicit set of `TASKER_*` variables standing in
    /// for the process environment. `None` reads the real environment.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading configuration"
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment, env_overrides)?;
        config.engine.environment = environment.to_string();
        config.validate()?;

        info!(
            environment = %environment,
            max_concurrent_steps = config.execution.max_concurrent_steps,
            poll_interval_ms = config.orchestration.poll_interval_ms,
            identity_strategy = ?config.engine.identity_strategy,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedded use)
    pub fn from_config(config: TaskerConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.engine.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &TaskerConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment, from `TASKER_ENV` then `APP_ENV`
    pub fn detect_environment() -> String {
        crate::logging::get_environment()
    }

    fn default_config_directory() -> PathBuf {
        env::var("TASKER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        env_overrides: Option<HashMap<String, String>>,
    ) -> ConfigResult<TaskerConfig> {
        let defaults = Config::try_from(&TaskerConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let base_file = config_directory.join(BASE_CONFIG_FILE);
        let env_file = config_directory.join(format!("tasker-config-{environment}.yaml"));

        debug!(
            base_file = %base_file.display(),
            base_present = base_file.exists(),
            env_file = %env_file.display(),
            env_present = env_file.exists(),
            "Resolved configuration files"
        );

        let env_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env_overrides);

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file).required(false))
            .add_source(File::from(env_file).required(false))
            .add_source(env_source)
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        merged
            .try_deserialize::<TaskerConfig>()
            .map_err(|e| ConfigurationError::load_error(environment, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn empty_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn test_defaults_without_files() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", empty_env())
                .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().execution.max_concurrent_steps, 10);
        assert!(manager.config().is_test_environment());
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tasker-config.yaml"),
            "execution:\n  max_concurrent_steps: 8\nbackoff:\n  base_delay_ms: 50\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("tasker-config-test.yaml"),
            "execution:\n  max_concurrent_steps: 2\n",
        )
        .unwrap();

        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", empty_env())
                .unwrap();
        assert_eq!(manager.config().execution.max_concurrent_steps, 2);
        assert_eq!(manager.config().backoff.base_delay_ms, 50);
        assert_eq!(manager.config().backoff.max_delay_ms, 300_000);
    }

    #[test]
    fn test_environment_variables_override_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tasker-config.yaml"),
            "orchestration:\n  poll_interval_ms: 100\n",
        )
        .unwrap();

        let mut vars = HashMap::new();
        vars.insert(
            "TASKER_ORCHESTRATION__POLL_INTERVAL_MS".to_string(),
            "20".to_string(),
        );
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", Some(vars))
                .unwrap();
        assert_eq!(manager.config().orchestration.poll_interval_ms, 20);
    }

    #[test]
    fn test_invalid_layered_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tasker-config.yaml"),
            "execution:\n  max_concurrent_steps: 0\n",
        )
        .unwrap();
        let result =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", empty_env());
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
