//! # Tasker Engine Configuration
//!
//! Typed configuration for the orchestration engine. Every section has safe
//! development defaults so an embedded engine can run with no files at all;
//! deployments layer YAML files and `TASKER_*` environment variables on top
//! through [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let max_in_flight = manager.config().execution.max_concurrent_steps;
//! let poll = manager.config().orchestration.poll_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::models::IdentityStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/tasker-config.yaml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskerConfig {
    /// Step execution limits and retry defaults
    pub execution: ExecutionConfig,

    /// Backoff applied between retry attempts
    pub backoff: BackoffConfig,

    /// Coordinator loop timing
    pub orchestration: OrchestrationConfig,

    /// Engine-wide behaviour (environment, identity strategy)
    pub engine: EngineConfig,

    /// Dependency graph processing settings
    pub dependency_graph: DependencyGraphConfig,

    /// Lifecycle event channel settings
    pub events: EventsConfig,

    /// Database connection settings for the Postgres store
    pub database: DatabaseConfig,
}

/// Task execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on simultaneously in-flight steps, shared by every task in the process
    pub max_concurrent_steps: usize,
    pub step_execution_timeout_ms: u64,
    /// Retry limit for steps whose template does not set one
    pub default_retry_limit: i32,
    pub default_retryable: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 10,
            step_execution_timeout_ms: 30_000,
            default_retry_limit: 3,
            default_retryable: true,
        }
    }
}

impl ExecutionConfig {
    /// Get step execution timeout as Duration
    pub fn step_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.step_execution_timeout_ms)
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the computed delay (0.0 to 1.0)
    pub jitter_max_percentage: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
        }
    }
}

/// Coordinator loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Re-poll interval while steps owned by another coordinator are in flight
    pub poll_interval_ms: u64,
    /// Longest single sleep while waiting for a backoff deadline
    pub max_poll_interval_ms: u64,
    /// Age after which an `in_progress` claim is considered abandoned
    pub stale_claim_timeout_seconds: u64,
    /// Optional wall-clock budget for one `execute_task` call
    pub max_workflow_duration_seconds: Option<u64>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_poll_interval_ms: 5_000,
            stale_claim_timeout_seconds: 300,
            max_workflow_duration_seconds: None,
        }
    }
}

impl OrchestrationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_seconds)
    }

    pub fn max_workflow_duration(&self) -> Option<Duration> {
        self.max_workflow_duration_seconds.map(Duration::from_secs)
    }
}

/// Task processing engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub environment: String,
    pub identity_strategy: IdentityStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            identity_strategy: IdentityStrategy::Strict,
        }
    }
}

/// Dependency graph processing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DependencyGraphConfig {
    /// Maximum number of dependency levels a template may declare
    pub max_depth: usize,
}

impl Default for DependencyGraphConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::constants::system::MAX_DEPENDENCY_DEPTH,
        }
    }
}

/// Event processing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
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

/// Database connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit connection URL; falls back to `DATABASE_URL`
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_seconds: 10,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection URL from configuration or `DATABASE_URL`
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl TaskerConfig {
    /// Validate configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.execution.max_concurrent_steps == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_steps",
                "0",
                "at least one step must be allowed in flight",
            ));
        }

        if self.execution.step_execution_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.step_execution_timeout_ms",
                "0",
                "step execution timeout must be greater than 0",
            ));
        }

        if self.execution.default_retry_limit < 1 {
            return Err(ConfigurationError::invalid_value(
                "execution.default_retry_limit",
                self.execution.default_retry_limit.to_string(),
                "retry limit counts total attempts and must be at least 1",
            ));
        }

        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_ms",
                self.backoff.base_delay_ms.to_string(),
                format!(
                    "base delay must not exceed backoff.max_delay_ms ({})",
                    self.backoff.max_delay_ms
                ),
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.multiplier",
                self.backoff.multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.backoff.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_max_percentage",
                self.backoff.jitter_max_percentage.to_string(),
                "jitter must be between 0.0 and 1.0",
            ));
        }

        if self.orchestration.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.poll_interval_ms",
                "0",
                "poll interval must be greater than 0",
            ));
        }

        if self.orchestration.max_poll_interval_ms < self.orchestration.poll_interval_ms {
            return Err(ConfigurationError::invalid_value(
                "orchestration.max_poll_interval_ms",
                self.orchestration.max_poll_interval_ms.to_string(),
                "max poll interval must be at least orchestration.poll_interval_ms",
            ));
        }

        if self.dependency_graph.max_depth == 0 {
            return Err(ConfigurationError::invalid_value(
                "dependency_graph.max_depth",
                "0",
                "max depth must be greater than 0",
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                "0",
                "event channel capacity must be greater than 0",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Check if running in test environment
    pub fn is_test_environment(&self) -> bool {
        self.engine.environment == "test"
    }

    /// Check if running in production environment
    pub fn is_production_environment(&self) -> bool {
        self.engine.environment == "production"
    }
}
