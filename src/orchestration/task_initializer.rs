//! # Task Initializer
//!
//! Turns a [`TaskRequest`] into a persisted task: resolves the registered
//! template, computes the identity hash, materializes one workflow step per
//! step definition and one `provides` edge per declared dependency, and hands
//! the whole set to [`TaskStore::create_task`], which writes it atomically
//! together with the initial `pending` transitions.
//!
//! A request whose identity hash matches a task that is still pending, in
//! progress or in error returns that task unchanged (`created == false`).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::models::TaskRequest;
//! use tasker_engine::orchestration::TaskInitializer;
//! use serde_json::json;
//!
//! # async fn example(initializer: TaskInitializer) -> Result<(), Box<dyn std::error::Error>> {
//! let request = TaskRequest::new("order_fulfillment", "ecommerce")
//!     .with_context(json!({"order_id": 12345}))
//!     .with_initiator("test_user");
//!
//! let result = initializer.create_task_from_request(request).await?;
//! println!("Task {} with {} steps", result.task.task_id, result.step_count);
//! # Ok(())
//! # }
//! ```

use crate::config::ExecutionConfig;
use crate::constants::events::{STEP_INITIALIZED, TASK_INITIALIZED};
use crate::constants::system::PROVIDES_EDGE_NAME;
use crate::database::{NewTask, TaskStore};
use crate::events::{EventPublisher, LifecycleEvent};
use crate::logging::log_task_operation;
use crate::models::{IdentityHasher, Task, TaskRequest, WorkflowStep, WorkflowStepEdge};
use crate::orchestration::errors::{OrchestrationError, OrchestrationResult};
use crate::registry::{RegisteredTemplate, TaskHandlerRegistry};
use crate::state_machine::{TaskState, WorkflowStepState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Result of task initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInitializationResult {
    pub task: Task,
    /// False when an existing non-terminal task was returned
    pub created: bool,
    pub step_count: usize,
}

impl TaskInitializationResult {
    pub fn task_id(&self) -> Uuid {
        self.task.task_id
    }
}

#[derive(Clone)]
pub struct TaskInitializer {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskHandlerRegistry>,
    hasher: Arc<dyn IdentityHasher>,
    execution: ExecutionConfig,
    event_publisher: EventPublisher,
}

impl std::fmt::Debug for TaskInitializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInitializer")
            .field("registry", &self.registry)
            .field("default_retry_limit", &self.execution.default_retry_limit)
            .finish()
    }
}

impl TaskInitializer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskHandlerRegistry>,
        hasher: Arc<dyn IdentityHasher>,
        execution: ExecutionConfig,
        event_publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            registry,
            hasher,
            execution,
            event_publisher,
        }
    }

    /// Create a task from a request, or return the live duplicate
    #[instrument(skip(self, request), fields(task_name = %request.name, namespace = %request.namespace))]
    pub async fn create_task_from_request(
        &self,
        request: TaskRequest,
    ) -> OrchestrationResult<TaskInitializationResult> {
        if request.name.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest {
                reason: "task name must not be empty".to_string(),
            });
        }

        let registered = self.registry.resolve_request(&request).ok_or_else(|| {
            OrchestrationError::TemplateNotFound {
                namespace: request.namespace.clone(),
                name: request.name.clone(),
                version: request
                    .version
                    .clone()
                    .unwrap_or_else(|| "latest".to_string()),
            }
        })?;

        validate_bypass_steps(&request, &registered)?;

        let version = registered.version().to_string();
        let identity_hash = self.hasher.identity_hash(&request, &version)?;
        let task = Task::from_request(&request, version, identity_hash);
        let (steps, edges) = self.materialize_steps(task.task_id, &registered)?;
        debug!(
            task_id = %task.task_id,
            step_count = steps.len(),
            edge_count = edges.len(),
            "Materialized workflow steps"
        );

        let creation = self
            .store
            .create_task(NewTask {
                task,
                steps: steps.clone(),
                edges,
            })
            .await?;

        let step_count = if creation.created {
            steps.len()
        } else {
            self.store.list_steps(creation.task.task_id).await?.len()
        };

        if creation.created {
            self.publish_initialized(&creation.task, &steps).await;
            log_task_operation(
                "create_task",
                Some(creation.task.task_id),
                Some(&creation.task.name),
                Some(&creation.task.namespace),
                "created",
                Some(&format!("{step_count} steps")),
            );
        } else {
            log_task_operation(
                "create_task",
                Some(creation.task.task_id),
                Some(&creation.task.name),
                Some(&creation.task.namespace),
                "deduplicated",
                Some(&format!("identity_hash={}", creation.task.identity_hash)),
            );
        }

        Ok(TaskInitializationResult {
            task: creation.task,
            created: creation.created,
            step_count,
        })
    }

    /// One step per definition, in declaration order, and one edge per dependency
    fn materialize_steps(
        &self,
        task_id: Uuid,
        registered: &RegisteredTemplate,
    ) -> OrchestrationResult<(Vec<WorkflowStep>, Vec<WorkflowStepEdge>)> {
        let definitions = &registered.template.steps;
        let mut steps = Vec::with_capacity(definitions.len());
        let mut ids_by_name: HashMap<&str, Uuid> = HashMap::with_capacity(definitions.len());

        for (position, definition) in definitions.iter().enumerate() {
            let step = WorkflowStep::new(
                task_id,
                definition.name.clone(),
                position as i32,
                definition
                    .retry
                    .retryable
                    .unwrap_or(self.execution.default_retryable),
                definition
                    .retry
                    .retry_limit
                    .unwrap_or(self.execution.default_retry_limit)
                    .max(1),
                definition.skippable,
            );
            ids_by_name.insert(definition.name.as_str(), step.workflow_step_id);
            steps.push(step);
        }

        let mut edges = Vec::new();
        for definition in definitions {
            let to_step_id = ids_by_name[definition.name.as_str()];
            for dependency in definition.dependency_names() {
                let from_step_id = ids_by_name.get(dependency.as_str()).copied().ok_or_else(|| {
                    OrchestrationError::Registry(format!(
                        "Step '{}' depends on unknown step '{dependency}'",
                        definition.name
                    ))
                })?;
                edges.push(WorkflowStepEdge {
                    task_id,
                    from_step_id,
                    to_step_id,
                    name: PROVIDES_EDGE_NAME.to_string(),
                });
            }
        }

        Ok((steps, edges))
    }

    async fn publish_initialized(&self, task: &Task, steps: &[WorkflowStep]) {
        let task_event = LifecycleEvent::task(
            TASK_INITIALIZED,
            task.task_id,
            None,
            TaskState::Pending.as_str(),
            json!({
                "task_name": task.name,
                "namespace": task.namespace,
                "version": task.version,
                "step_count": steps.len(),
            }),
        );
        self.event_publisher.publish(task_event).await;

        for step in steps {
            let step_event = LifecycleEvent::step(
                STEP_INITIALIZED,
                step.workflow_step_id,
                task.task_id,
                None,
                WorkflowStepState::Pending.as_str(),
                json!({ "step_name": step.name }),
            );
            self.event_publisher.publish(step_event).await;
        }
    }
}

/// Bypassed steps must exist in the template and be declared skippable
fn validate_bypass_steps(
    request: &TaskRequest,
    registered: &RegisteredTemplate,
) -> OrchestrationResult<()> {
    for name in &request.bypass_steps {
        match registered.step_definition(name) {
            None => {
                return Err(OrchestrationError::InvalidRequest {
                    reason: format!(
                        "bypass step '{name}' is not a step of {}",
                        registered.key()
                    ),
                })
            }
            Some(definition) if !definition.skippable => {
                return Err(OrchestrationError::InvalidRequest {
                    reason: format!("bypass step '{name}' is not skippable"),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}
