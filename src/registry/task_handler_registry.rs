//! # Task Handler Registry
//!
//! Resolves a submission's `(namespace, name, version)` to a registered task
//! template and the step handlers its steps reference.
//!
//! ## Lifecycle
//!
//! ```text
//! TaskHandlerRegistryBuilder --register_*--> build() --> Arc<TaskHandlerRegistry> (immutable)
//! ```
//!
//! Everything that can be wrong with a template is rejected by `build()`:
//! malformed YAML, dangling or cyclic dependencies, graphs deeper than the
//! configured limit, and callables no handler was registered under. After a
//! successful build, every step of every template resolves to a handler, so
//! the coordinator never meets an unknown callable at runtime.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::orchestration::handler_fn;
//! use tasker_engine::orchestration::StepHandlerResult;
//! use tasker_engine::registry::TaskHandlerRegistryBuilder;
//! use serde_json::json;
//!
//! # fn example() -> tasker_engine::Result<()> {
//! let registry = TaskHandlerRegistryBuilder::new("development", 50)
//!     .register_handler(
//!         "noop",
//!         handler_fn(|_ctx| async { Ok(StepHandlerResult::Complete(json!({}))) }),
//!     )
//!     .register_template_yaml(
//!         "name: hello\nnamespace_name: demo\nsteps:\n  - name: only\n    handler:\n      callable: noop\n",
//!     )?
//!     .build()?;
//! assert!(registry.resolve("demo", "hello", None).is_some());
//! # Ok(())
//! # }
//! ```

use crate::constants::system::MAX_WORKFLOW_STEPS;
use crate::error::{Result, TaskerError};
use crate::logging::log_registry_operation;
use crate::models::{StepDefinition, TaskRequest, TaskTemplate};
use crate::orchestration::dependency_graph::DependencyAnalysis;
use crate::orchestration::step_handler::StepHandler;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Key for template lookup in the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl TemplateKey {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn from_template(template: &TaskTemplate) -> Self {
        Self::new(&template.namespace_name, &template.name, &template.version)
    }

    /// Convert to string key for logs and error messages
    pub fn key_string(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.name, self.version)
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.version)
    }
}

/// A validated template with its dependency analysis and resolved handlers
pub struct RegisteredTemplate {
    /// Template with the registry environment's overrides applied
    pub template: TaskTemplate,
    pub analysis: Arc<DependencyAnalysis>,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl RegisteredTemplate {
    pub fn key(&self) -> TemplateKey {
        TemplateKey::from_template(&self.template)
    }

    pub fn version(&self) -> &str {
        &self.template.version
    }

    pub fn step_definition(&self, step_name: &str) -> Option<&StepDefinition> {
        self.template.get_step(step_name)
    }

    /// Handler resolved for `step_name` at build time
    pub fn handler_for(&self, step_name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_name).cloned()
    }
}

impl fmt::Debug for RegisteredTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTemplate")
            .field("key", &self.key())
            .field("steps", &self.template.steps.len())
            .field("max_depth", &self.analysis.max_depth)
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_templates: usize,
    pub total_step_handlers: usize,
    pub namespaces: Vec<String>,
}

/// Collects handlers and templates, then validates them all at once
pub struct TaskHandlerRegistryBuilder {
    environment: String,
    max_depth: usize,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    templates: Vec<TaskTemplate>,
}

impl TaskHandlerRegistryBuilder {
    pub fn new(environment: impl Into<String>, max_depth: usize) -> Self {
        Self {
            environment: environment.into(),
            max_depth,
            handlers: HashMap::new(),
            templates: Vec::new(),
        }
    }

    /// Builder seeded from the engine configuration
    pub fn from_config(config: &crate::config::TaskerConfig) -> Self {
        Self::new(&config.engine.environment, config.dependency_graph.max_depth)
    }

    /// Register a step handler under `callable`. A later registration with the
    /// same callable replaces the earlier one.
    pub fn register_handler(
        mut self,
        callable: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Self {
        let callable = callable.into();
        if self.handlers.insert(callable.clone(), handler).is_some() {
            debug!(callable = %callable, "Replacing previously registered step handler");
        }
        self
    }

    pub fn register_template(mut self, template: TaskTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn register_template_yaml(self, yaml: &str) -> Result<Self> {
        let template = TaskTemplate::from_yaml(yaml)?;
        Ok(self.register_template(template))
    }

    pub fn register_template_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let template = TaskTemplate::from_yaml_file(path.as_ref())?;
        Ok(self.register_template(template))
    }

    /// Register every `*.yaml` / `*.yml` file in `dir`, in file name order
    pub fn register_template_directory(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            TaskerError::RegistryError(format!(
                "Failed to read template directory {}: {e}",
                dir.display()
            ))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        paths.sort();

        for path in paths {
            self = self.register_template_file(&path)?;
        }
        Ok(self)
    }

    /// Validate every template and resolve every callable.
    ///
    /// Fails on the first problem found; nothing is registered on failure.
    pub fn build(self) -> Result<Arc<TaskHandlerRegistry>> {
        let mut templates: HashMap<TemplateKey, Arc<RegisteredTemplate>> = HashMap::new();

        for raw in &self.templates {
            let template = raw.resolve_for_environment(&self.environment);
            let key = TemplateKey::from_template(&template);

            if templates.contains_key(&key) {
                return Err(TaskerError::RegistryError(format!(
                    "Task template {key} is registered more than once"
                )));
            }
            if template.steps.len() > MAX_WORKFLOW_STEPS {
                return Err(TaskerError::ValidationError(format!(
                    "Task template {key} declares {} steps; at most {MAX_WORKFLOW_STEPS} are allowed",
                    template.steps.len()
                )));
            }

            let analysis = template.validate(self.max_depth).map_err(|e| {
                log_registry_operation(
                    "register_template",
                    Some(&key.namespace),
                    Some(&key.name),
                    Some(&key.version),
                    "rejected",
                    Some(&e.to_string()),
                );
                e
            })?;

            let mut handlers = HashMap::with_capacity(template.steps.len());
            for step in &template.steps {
                let callable = &step.handler.callable;
                let handler = self.handlers.get(callable).ok_or_else(|| {
                    TaskerError::RegistryError(format!(
                        "Step '{}' of {key} references unregistered handler '{callable}'",
                        step.name
                    ))
                })?;
                handlers.insert(step.name.clone(), Arc::clone(handler));
            }

            log_registry_operation(
                "register_template",
                Some(&key.namespace),
                Some(&key.name),
                Some(&key.version),
                "registered",
                Some(&format!(
                    "{} steps, {} levels",
                    template.steps.len(),
                    analysis.max_depth
                )),
            );

            templates.insert(
                key,
                Arc::new(RegisteredTemplate {
                    template,
                    analysis,
                    handlers,
                }),
            );
        }

        Ok(Arc::new(TaskHandlerRegistry {
            environment: self.environment,
            templates,
            step_handler_count: self.handlers.len(),
        }))
    }
}

/// Immutable lookup of registered templates
pub struct TaskHandlerRegistry {
    environment: String,
    templates: HashMap<TemplateKey, Arc<RegisteredTemplate>>,
    step_handler_count: usize,
}

impl TaskHandlerRegistry {
    /// Find a template; `version: None` selects the highest registered version
    pub fn resolve(
        &self,
        namespace: &str,
        name: &str,
        version: Option<&str>,
    ) -> Option<Arc<RegisteredTemplate>> {
        match version {
            Some(version) => self
                .templates
                .get(&TemplateKey::new(namespace, name, version))
                .cloned(),
            None => self
                .templates
                .iter()
                .filter(|(key, _)| key.namespace == namespace && key.name == name)
                .max_by(|(a, _), (b, _)| compare_versions(&a.version, &b.version))
                .map(|(_, template)| Arc::clone(template)),
        }
    }

    pub fn resolve_request(&self, request: &TaskRequest) -> Option<Arc<RegisteredTemplate>> {
        self.resolve(&request.namespace, &request.name, request.version.as_deref())
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Registered keys, sorted
    pub fn template_keys(&self) -> Vec<TemplateKey> {
        let mut keys: Vec<TemplateKey> = self.templates.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> RegistryStats {
        let mut namespaces: Vec<String> = self
            .templates
            .keys()
            .map(|key| key.namespace.clone())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        RegistryStats {
            total_templates: self.templates.len(),
            total_step_handlers: self.step_handler_count,
            namespaces,
        }
    }
}

impl fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("environment", &self.environment)
            .field("templates", &self.template_keys())
            .finish()
    }
}

/// Dotted numeric versions compare component-wise; anything else lexically
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.parse::<u64>().ok()).collect()
    };
    match (parse(a), parse(b)) {
        (Some(a_parts), Some(b_parts)) => a_parts.cmp(&b_parts),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::step_handler::{handler_fn, StepHandlerResult};
    use serde_json::json;

    fn noop() -> Arc<dyn StepHandler> {
        handler_fn(|_ctx| async { Ok(StepHandlerResult::Complete(json!({}))) })
    }

    fn template_yaml(version: &str, callable: &str) -> String {
        format!(
            r#"
name: order_fulfillment
namespace_name: ecommerce
version: "{version}"
steps:
  - name: validate
    handler:
      callable: {callable}
  - name: ship
    dependency: validate
    handler:
      callable: {callable}
environments:
  test:
    steps:
      - name: ALL
        timeout_seconds: 5
"#
        )
    }

    #[test]
    fn test_build_resolves_handlers_and_overrides() {
        let registry = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_yaml(&template_yaml("1.0.0", "noop"))
            .unwrap()
            .build()
            .unwrap();

        let registered = registry
            .resolve("ecommerce", "order_fulfillment", Some("1.0.0"))
            .unwrap();
        assert!(registered.handler_for("ship").is_some());
        assert!(registered.handler_for("missing").is_none());
        assert_eq!(
            registered.step_definition("validate").unwrap().timeout_seconds,
            Some(5)
        );
        assert_eq!(registered.analysis.topological_order, vec!["validate", "ship"]);
    }

    #[test]
    fn test_unresolved_callable_fails_fast() {
        let err = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_yaml(&template_yaml("1.0.0", "missing_handler"))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, TaskerError::RegistryError(msg) if msg.contains("missing_handler")));
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let err = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_yaml(&template_yaml("1.0.0", "noop"))
            .unwrap()
            .register_template_yaml(&template_yaml("1.0.0", "noop"))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, TaskerError::RegistryError(_)));
    }

    #[test]
    fn test_cyclic_template_rejected() {
        let yaml = r#"
name: loop
steps:
  - name: a
    dependency: b
    handler: { callable: noop }
  - name: b
    dependency: a
    handler: { callable: noop }
"#;
        let err = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_yaml(yaml)
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, TaskerError::GraphValidationError(_)));
    }

    #[test]
    fn test_unversioned_lookup_picks_highest_version() {
        let registry = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_yaml(&template_yaml("1.2.0", "noop"))
            .unwrap()
            .register_template_yaml(&template_yaml("1.10.0", "noop"))
            .unwrap()
            .register_template_yaml(&template_yaml("1.9.3", "noop"))
            .unwrap()
            .build()
            .unwrap();

        let latest = registry
            .resolve("ecommerce", "order_fulfillment", None)
            .unwrap();
        assert_eq!(latest.version(), "1.10.0");
        assert!(registry.resolve("ecommerce", "unknown", None).is_none());

        let stats = registry.stats();
        assert_eq!(stats.total_templates, 3);
        assert_eq!(stats.namespaces, vec!["ecommerce".to_string()]);
    }

    #[test]
    fn test_version_comparison() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("2", "10"), Ordering::Less);
        assert_eq!(compare_versions("beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn test_template_directory_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), template_yaml("1.0.0", "noop")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = TaskHandlerRegistryBuilder::new("test", 50)
            .register_handler("noop", noop())
            .register_template_directory(dir.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            registry.template_keys(),
            vec![TemplateKey::new("ecommerce", "order_fulfillment", "1.0.0")]
        );
    }
}
