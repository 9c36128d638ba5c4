//! Configuration, registry and store builders for the integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_engine::config::TaskerConfig;
use tasker_engine::database::{InMemoryTaskStore, NewTask, TaskCreation, TaskStore};
use tasker_engine::models::{
    StepUpdate, Task, TaskTransition, WorkflowStep, WorkflowStepEdge, WorkflowStepTransition,
};
use tasker_engine::orchestration::{StepHandler, WorkflowCoordinator, WorkflowCoordinatorConfig};
use tasker_engine::registry::{TaskHandlerRegistry, TaskHandlerRegistryBuilder};
use tasker_engine::state_machine::errors::{PersistenceError, PersistenceResult};
use tasker_engine::state_machine::{TaskState, WorkflowStepState};
use uuid::Uuid;

/// Engine configuration with millisecond backoff and no jitter
pub fn test_config() -> TaskerConfig {
    let mut config = TaskerConfig::default();
    config.engine.environment = "test".to_string();
    config.execution.max_concurrent_steps = 4;
    config.backoff.base_delay_ms = 10;
    config.backoff.max_delay_ms = 50;
    config.backoff.jitter_enabled = false;
    config
}

pub fn coordinator_config() -> WorkflowCoordinatorConfig {
    WorkflowCoordinatorConfig::for_testing()
}

/// Fluent setup of a registry and a coordinator over an in-memory store
pub struct TestEngine {
    config: TaskerConfig,
    builder: TaskHandlerRegistryBuilder,
    coordinator_config: WorkflowCoordinatorConfig,
}

impl TestEngine {
    pub fn new() -> Self {
        let config = test_config();
        Self {
            builder: TaskHandlerRegistryBuilder::from_config(&config),
            config,
            coordinator_config: coordinator_config(),
        }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut TaskerConfig)) -> Self {
        f(&mut self.config);
        self.builder = TaskHandlerRegistryBuilder::from_config(&self.config);
        self
    }

    pub fn coordinator_config(mut self, f: impl FnOnce(&mut WorkflowCoordinatorConfig)) -> Self {
        f(&mut self.coordinator_config);
        self
    }

    pub fn handler(mut self, callable: &str, handler: Arc<dyn StepHandler>) -> Self {
        self.builder = self.builder.register_handler(callable, handler);
        self
    }

    pub fn template(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .register_template_yaml(yaml)
            .expect("test template should parse");
        self
    }

    pub fn registry(self) -> Arc<TaskHandlerRegistry> {
        self.builder.build().expect("test registry should build")
    }

    /// Coordinator over a fresh in-memory store
    pub fn build(self) -> (WorkflowCoordinator, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let coordinator = self.build_with_store(store.clone());
        (coordinator, store)
    }

    pub fn build_with_store(self, store: Arc<dyn TaskStore>) -> WorkflowCoordinator {
        let config = self.config.clone();
        let coordinator_config = self.coordinator_config.clone();
        let registry = self.registry();
        WorkflowCoordinator::new(store, registry, &config).with_config(coordinator_config)
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until `check` passes or the timeout elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

pub async fn step_named(store: &dyn TaskStore, task_id: Uuid, name: &str) -> WorkflowStep {
    store
        .list_steps(task_id)
        .await
        .expect("steps should load")
        .into_iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("step {name} should exist"))
}

pub async fn step_state_path(store: &dyn TaskStore, step_id: Uuid) -> Vec<WorkflowStepState> {
    store
        .step_transitions(step_id)
        .await
        .expect("transitions should load")
        .into_iter()
        .map(|t| t.to_state)
        .collect()
}

/// Store wrapper for fault injection: step transitions fail with a database
/// error once armed, and a cancel can be slipped in ahead of a claim
#[derive(Debug)]
pub struct FailingStore {
    inner: InMemoryTaskStore,
    fail_step_transitions: AtomicBool,
    cancel_on_next_claim: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            fail_step_transitions: AtomicBool::new(false),
            cancel_on_next_claim: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.fail_step_transitions.store(true, Ordering::SeqCst);
    }

    /// Cancel the owning task just before the next `pending -> in_progress` write
    pub fn cancel_on_next_claim(&self) {
        self.cancel_on_next_claim.store(true, Ordering::SeqCst);
    }

    async fn cancel_owning_task(&self, step_id: Uuid) -> PersistenceResult<()> {
        let task_id = self.inner.get_step(step_id).await?.task_id;
        let current = self.inner.get_task_state(task_id).await?;
        self.inner
            .transition_task(
                task_id,
                current,
                TaskState::Cancelled,
                serde_json::json!({ "reason": "operator cancel" }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FailingStore {
    async fn create_task(&self, new_task: NewTask) -> PersistenceResult<TaskCreation> {
        self.inner.create_task(new_task).await
    }

    async fn get_task(&self, task_id: Uuid) -> PersistenceResult<Task> {
        self.inner.get_task(task_id).await
    }

    async fn get_task_state(&self, task_id: Uuid) -> PersistenceResult<TaskState> {
        self.inner.get_task_state(task_id).await
    }

    async fn list_steps(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStep>> {
        self.inner.list_steps(task_id).await
    }

    async fn get_step(&self, step_id: Uuid) -> PersistenceResult<WorkflowStep> {
        self.inner.get_step(step_id).await
    }

    async fn list_edges(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStepEdge>> {
        self.inner.list_edges(task_id).await
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected_from: TaskState,
        to: TaskState,
        metadata: Value,
    ) -> PersistenceResult<TaskTransition> {
        self.inner
            .transition_task(task_id, expected_from, to, metadata)
            .await
    }

    async fn transition_step(
        &self,
        step_id: Uuid,
        expected_from: WorkflowStepState,
        to: WorkflowStepState,
        metadata: Value,
        update: StepUpdate,
    ) -> PersistenceResult<WorkflowStep> {
        if self.fail_step_transitions.load(Ordering::SeqCst) {
            return Err(PersistenceError::Database(
                "connection reset by peer".to_string(),
            ));
        }
        if expected_from == WorkflowStepState::Pending
            && to == WorkflowStepState::InProgress
            && self.cancel_on_next_claim.swap(false, Ordering::SeqCst)
        {
            self.cancel_owning_task(step_id).await?;
        }
        self.inner
            .transition_step(step_id, expected_from, to, metadata, update)
            .await
    }

    async fn task_transitions(&self, task_id: Uuid) -> PersistenceResult<Vec<TaskTransition>> {
        self.inner.task_transitions(task_id).await
    }

    async fn step_transitions(
        &self,
        step_id: Uuid,
    ) -> PersistenceResult<Vec<WorkflowStepTransition>> {
        self.inner.step_transitions(step_id).await
    }
}
