//! Task Template System
//!
//! YAML-driven task definitions. A `TaskTemplate` declares, for one task type,
//! the ordered step definitions, each with a handler reference, dependency
//! names, retry defaults and a skippable flag. Templates are immutable once
//! registered; the realized per-task DAG is a copy of the template DAG with
//! concrete step ids substituted for names.
//!
//! A step may declare its dependencies with either `dependency` (one name) or
//! `dependencies` (a list); both are accepted and merged.

use crate::error::{Result, TaskerError};
use crate::orchestration::dependency_graph::{DependencyAnalysis, DependencyGraphAnalyzer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Complete task template with all workflow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Unique task name within namespace
    pub name: String,

    #[serde(default = "default_namespace", alias = "namespace")]
    pub namespace_name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub description: Option<String>,

    /// Workflow step definitions, in declaration order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Environment-specific step overrides
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentOverride>,
}

fn default_namespace() -> String {
    crate::constants::system::DEFAULT_NAMESPACE.to_string()
}

fn default_version() -> String {
    crate::constants::system::DEFAULT_TASK_VERSION.to_string()
}

/// Handler definition with callable and initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDefinition {
    /// Name the step handler was registered under
    pub callable: String,

    /// Initialization parameters handed to the handler with every invocation
    #[serde(default)]
    pub initialization: HashMap<String, Value>,
}

/// Individual workflow step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub description: Option<String>,

    pub handler: HandlerDefinition,

    /// Single dependency shorthand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,

    #[serde(default, alias = "depends_on_steps")]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfiguration,

    #[serde(default)]
    pub skippable: bool,

    /// Per-step override of the engine's step execution timeout
    pub timeout_seconds: Option<u64>,
}

/// Retry configuration; unset fields fall back to the engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfiguration {
    pub retryable: Option<bool>,

    /// Total attempts allowed, including the first
    #[serde(alias = "max_attempts")]
    pub retry_limit: Option<i32>,

    pub backoff_base_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

impl RetryConfiguration {
    /// Overlay the fields `other` sets
    pub fn merge(&mut self, other: &RetryConfiguration) {
        self.retryable = other.retryable.or(self.retryable);
        self.retry_limit = other.retry_limit.or(self.retry_limit);
        self.backoff_base_ms = other.backoff_base_ms.or(self.backoff_base_ms);
        self.max_backoff_ms = other.max_backoff_ms.or(self.max_backoff_ms);
    }
}

/// Overrides applied when a template is registered for a given environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentOverride {
    #[serde(default)]
    pub steps: Vec<StepOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOverride {
    /// Step to override; `ALL` applies to every step
    pub name: String,
    #[serde(default)]
    pub initialization: HashMap<String, Value>,
    pub timeout_seconds: Option<u64>,
    pub retry: Option<RetryConfiguration>,
}

impl TaskTemplate {
    /// Create from YAML string
    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_str)
            .map_err(|e| TaskerError::ValidationError(format!("Invalid task template YAML: {e}")))
    }

    /// Create from YAML file
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TaskerError::ValidationError(format!(
                "Failed to read task template {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&contents)
    }

    /// `namespace/name@version`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}@{}", self.namespace_name, self.name, self.version)
    }

    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Apply the overrides declared for `environment`, if any
    pub fn resolve_for_environment(&self, environment: &str) -> TaskTemplate {
        let mut resolved = self.clone();
        if let Some(env_override) = self.environments.get(environment) {
            for step_override in &env_override.steps {
                for step in resolved.steps.iter_mut() {
                    if step_override.name == "ALL" || step_override.name == step.name {
                        apply_step_override(step, step_override);
                    }
                }
            }
        }
        resolved
    }

    /// Build a graph analyzer over this template's steps
    pub fn dependency_graph(&self) -> DependencyGraphAnalyzer {
        DependencyGraphAnalyzer::from_step_definitions(&self.steps)
    }

    /// Validate template structure: names, dependencies, acyclicity and depth.
    ///
    /// Returns the dependency analysis so callers can keep it.
    pub fn validate(&self, max_depth: usize) -> Result<Arc<DependencyAnalysis>> {
        if self.name.trim().is_empty() {
            return Err(TaskerError::ValidationError(
                "Task template name must not be empty".to_string(),
            ));
        }

        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(TaskerError::ValidationError(format!(
                    "Task template {} declares a step with an empty name",
                    self.qualified_name()
                )));
            }
            if step.handler.callable.trim().is_empty() {
                return Err(TaskerError::ValidationError(format!(
                    "Step '{}' in {} has an empty handler callable",
                    step.name,
                    self.qualified_name()
                )));
            }
            if let Some(limit) = step.retry.retry_limit {
                if limit < 1 {
                    return Err(TaskerError::ValidationError(format!(
                        "Step '{}' in {} has retry_limit {limit}; at least 1 attempt is required",
                        step.name,
                        self.qualified_name()
                    )));
                }
            }
        }

        let analyzer = self.dependency_graph();
        let analysis = analyzer.analyze()?;
        analysis.ensure_valid(max_depth)?;
        Ok(analysis)
    }
}

fn apply_step_override(step: &mut StepDefinition, override_def: &StepOverride) {
    step.handler
        .initialization
        .extend(override_def.initialization.clone());

    if let Some(timeout) = override_def.timeout_seconds {
        step.timeout_seconds = Some(timeout);
    }

    if let Some(retry) = &override_def.retry {
        step.retry.merge(retry);
    }
}

impl StepDefinition {
    /// All dependency names, `dependency` first, without duplicates
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.dependencies.len() + 1);
        for name in self.dependency.iter().chain(self.dependencies.iter()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Check if this step depends on another step
    pub fn depends_on(&self, other_step_name: &str) -> bool {
        self.dependency.as_deref() == Some(other_step_name)
            || self.dependencies.iter().any(|d| d == other_step_name)
    }
}
