//! # Workflow Coordinator
//!
//! Drives one task to a terminal state. Each iteration of
//! [`WorkflowCoordinator::execute_task`] takes a fresh snapshot of the task
//! from the store and acts on its execution status:
//!
//! | status                     | action                                               |
//! |----------------------------|------------------------------------------------------|
//! | `has_ready_steps`          | skip bypassed steps, dispatch the rest to the executor |
//! | `processing`               | another claimant holds steps; wait one poll interval |
//! | `waiting_for_dependencies` | sleep until the earliest backoff deadline            |
//! | `all_complete`             | finalize to `complete`                               |
//! | `blocked_by_failures`      | finalize to `error`                                  |
//!
//! Before deciding, the coordinator repairs what a crashed coordinator may have
//! left behind: claims older than the stale-claim timeout are failed as
//! retryable `claim_expired` attempts, and retries recorded in an `error`
//! transition but never applied are moved back to `pending`.
//!
//! The store is the only shared state, so any number of coordinators may drive
//! distinct tasks, or even the same task, concurrently. A lost claim race is a
//! no-op; storage failures are returned to the caller.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::config::TaskerConfig;
//! use tasker_engine::database::InMemoryTaskStore;
//! use tasker_engine::models::TaskRequest;
//! use tasker_engine::orchestration::WorkflowCoordinator;
//! use tasker_engine::registry::TaskHandlerRegistry;
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<TaskHandlerRegistry>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaskerConfig::default();
//! let coordinator = WorkflowCoordinator::new(Arc::new(InMemoryTaskStore::new()), registry, &config);
//!
//! let result = coordinator
//!     .submit_and_execute(TaskRequest::new("order_fulfillment", "ecommerce"))
//!     .await?;
//! assert!(result.is_complete());
//! # Ok(())
//! # }
//! ```

use crate::config::TaskerConfig;
use crate::constants::status_groups::CANCELLABLE_STEP_STATES;
use crate::constants::system::CLAIM_EXPIRED_ERROR_CODE;
use crate::constants::ExecutionStatus;
use crate::database::TaskStore;
use crate::events::EventPublisher;
use crate::logging::{log_error, log_step_operation, log_task_operation};
use crate::models::{
    IdentityHasher, StepUpdate, StrategyIdentityHasher, Task, TaskExecutionContext, TaskRequest,
    WorkflowStep,
};
use crate::orchestration::backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig};
use crate::orchestration::error_classifier::ErrorClassifier;
use crate::orchestration::errors::{transition_error, OrchestrationError, OrchestrationResult};
use crate::orchestration::result_processor::{manual_resolution_metadata, StepResultProcessor};
use crate::orchestration::step_executor::{ClaimedStep, StepExecutor, StepLifecycle};
use crate::orchestration::step_handler::{
    StepExecutionContext, StepHandlerError, StepHandlerResult,
};
use crate::orchestration::task_finalizer::TaskFinalizer;
use crate::orchestration::task_initializer::{TaskInitializationResult, TaskInitializer};
use crate::orchestration::types::{StepExecutionOutcome, TaskOrchestrationResult};
use crate::orchestration::viable_step_discovery::{
    dependency_results, inputs_value, sibling_results, TaskSnapshot, ViableStepDiscovery,
};
use crate::registry::{RegisteredTemplate, TaskHandlerRegistry};
use crate::state_machine::{
    StepEvent, StepStateMachine, TaskEvent, TaskState, TaskStateMachine, WorkflowStepState,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Shortest wait the control loop ever sleeps
const MIN_POLL_WAIT: Duration = Duration::from_millis(1);

/// Idle wait that doubles while a task shows no progress.
///
/// Any change in the step counts resets it to the base interval.
#[derive(Debug, Clone)]
struct PollBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
    last_progress: Option<[usize; 5]>,
}

impl PollBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_POLL_WAIT);
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            last_progress: None,
        }
    }

    fn observe(&mut self, context: &TaskExecutionContext) {
        let progress = [
            context.pending_steps,
            context.in_progress_steps,
            context.completed_steps + context.skipped_steps + context.resolved_steps,
            context.failed_steps,
            context.cancelled_steps,
        ];
        if self.last_progress != Some(progress) {
            self.last_progress = Some(progress);
            self.current = self.base;
        }
    }

    fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }
}

/// Configuration for workflow coordination
#[derive(Debug, Clone)]
pub struct WorkflowCoordinatorConfig {
    /// First wait between snapshots while other claimants hold steps; doubles while idle
    pub poll_interval: Duration,
    /// Upper bound on any single wait, including backoff waits
    pub max_poll_interval: Duration,
    /// Age after which an `in_progress` claim is considered abandoned
    pub stale_claim_timeout: Duration,
    /// Give up on a run (without touching task state) after this long
    pub max_workflow_duration: Option<Duration>,
    /// Handler timeout for steps whose template sets none
    pub step_execution_timeout: Duration,
}

impl Default for WorkflowCoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&TaskerConfig::default())
    }
}

impl WorkflowCoordinatorConfig {
    /// Create configuration optimized for testing with short intervals
    pub fn for_testing() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(100),
            stale_claim_timeout: Duration::from_secs(60),
            max_workflow_duration: Some(Duration::from_secs(30)),
            step_execution_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &TaskerConfig) -> Self {
        Self {
            poll_interval: config.orchestration.poll_interval(),
            max_poll_interval: config.orchestration.max_poll_interval(),
            stale_claim_timeout: config.orchestration.stale_claim_timeout(),
            max_workflow_duration: config.orchestration.max_workflow_duration(),
            step_execution_timeout: config.execution.step_execution_timeout(),
        }
    }
}

/// Main workflow coordinator that orchestrates task execution
pub struct WorkflowCoordinator {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskHandlerRegistry>,
    initializer: TaskInitializer,
    discovery: ViableStepDiscovery,
    executor: StepExecutor,
    task_state_machine: TaskStateMachine,
    step_state_machine: StepStateMachine,
    result_processor: StepResultProcessor,
    finalizer: TaskFinalizer,
    event_publisher: EventPublisher,
    config: WorkflowCoordinatorConfig,
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowCoordinator {
    /// Coordinator with its own executor, event channel and identity hasher
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskHandlerRegistry>,
        config: &TaskerConfig,
    ) -> Self {
        Self::with_components(
            store,
            registry,
            config,
            EventPublisher::new(config.events.channel_capacity),
            StepExecutor::new(config.execution.max_concurrent_steps),
            Arc::new(StrategyIdentityHasher::new(config.engine.identity_strategy)),
        )
    }

    /// Coordinator sharing an executor (and therefore its concurrency bound),
    /// an event channel and an identity hasher with other components
    pub fn with_components(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskHandlerRegistry>,
        config: &TaskerConfig,
        event_publisher: EventPublisher,
        executor: StepExecutor,
        hasher: Arc<dyn IdentityHasher>,
    ) -> Self {
        let task_state_machine = TaskStateMachine::new(Arc::clone(&store), event_publisher.clone());
        let step_state_machine = StepStateMachine::new(Arc::clone(&store), event_publisher.clone());
        let classifier = ErrorClassifier::new(BackoffCalculator::new(
            BackoffCalculatorConfig::from(&config.backoff),
        ));

        Self {
            initializer: TaskInitializer::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                hasher,
                config.execution.clone(),
                event_publisher.clone(),
            ),
            discovery: ViableStepDiscovery::new(Arc::clone(&store)),
            result_processor: StepResultProcessor::new(
                Arc::clone(&store),
                step_state_machine.clone(),
                classifier,
            ),
            finalizer: TaskFinalizer::new(Arc::clone(&store), task_state_machine.clone()),
            task_state_machine,
            step_state_machine,
            executor,
            event_publisher,
            config: WorkflowCoordinatorConfig::from_config(config),
            registry,
            store,
        }
    }

    /// Replace the coordination timings
    pub fn with_config(mut self, config: WorkflowCoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.event_publisher
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &WorkflowCoordinatorConfig {
        &self.config
    }

    /// Create a task, or return the live task with the same identity
    pub async fn submit_task(
        &self,
        request: TaskRequest,
    ) -> OrchestrationResult<TaskInitializationResult> {
        self.initializer.create_task_from_request(request).await
    }

    /// Submit a task and drive it until it reaches a terminal state
    pub async fn submit_and_execute(
        &self,
        request: TaskRequest,
    ) -> OrchestrationResult<TaskOrchestrationResult> {
        let initialized = self.submit_task(request).await?;
        self.execute_task(initialized.task_id()).await
    }

    /// Drive a task until it is terminal, failed, or the workflow deadline passes
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn execute_task(&self, task_id: Uuid) -> OrchestrationResult<TaskOrchestrationResult> {
        let started = Instant::now();
        let task = Arc::new(self.store.get_task(task_id).await?);
        let template = self
            .registry
            .resolve(&task.namespace, &task.name, Some(&task.version))
            .ok_or_else(|| OrchestrationError::TemplateNotFound {
                namespace: task.namespace.clone(),
                name: task.name.clone(),
                version: task.version.clone(),
            })?;

        let lifecycle: Arc<dyn StepLifecycle> = Arc::new(TaskStepLifecycle {
            task: Arc::clone(&task),
            template: Arc::clone(&template),
            store: Arc::clone(&self.store),
            step_state_machine: self.step_state_machine.clone(),
            task_state_machine: self.task_state_machine.clone(),
            result_processor: self.result_processor.clone(),
            default_timeout: self.config.step_execution_timeout,
        });

        info!(task_id = %task_id, task = %task.qualified_name(), "Starting task execution");
        let mut steps_executed = 0usize;
        let mut poll = PollBackoff::new(self.config.poll_interval, self.config.max_poll_interval);

        loop {
            let snapshot = self.discovery.snapshot(task_id).await?;
            poll.observe(&snapshot.context);

            match snapshot.task_state {
                TaskState::Complete => {
                    let duration = started.elapsed();
                    log_task_operation(
                        "execute_task",
                        Some(task_id),
                        Some(&task.name),
                        Some(&task.namespace),
                        "complete",
                        Some(&format!("{steps_executed} steps in {}ms", duration.as_millis())),
                    );
                    return Ok(TaskOrchestrationResult::Complete {
                        task_id,
                        steps_executed,
                        duration,
                    });
                }
                TaskState::Cancelled => return Ok(TaskOrchestrationResult::Cancelled { task_id }),
                TaskState::ResolvedManually => {
                    return Ok(TaskOrchestrationResult::ResolvedManually { task_id })
                }
                TaskState::Error => return self.failed_result(task_id).await,
                TaskState::Pending | TaskState::InProgress => {}
            }

            if let Some(max) = self.config.max_workflow_duration {
                let elapsed = started.elapsed();
                if elapsed >= max {
                    warn!(
                        task_id = %task_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Workflow deadline exceeded; leaving task for a later run"
                    );
                    return Ok(TaskOrchestrationResult::TimedOut { task_id, elapsed });
                }
            }

            if self.recover(&snapshot, &template).await? > 0 {
                continue;
            }

            match snapshot.context.execution_status {
                ExecutionStatus::AllComplete | ExecutionStatus::BlockedByFailures => {
                    let finalization = self.finalizer.finalize(&snapshot.context).await?;
                    debug!(
                        task_id = %task_id,
                        action = ?finalization.action,
                        state = %finalization.task_state,
                        "Finalization attempted"
                    );
                }
                ExecutionStatus::HasReadySteps => {
                    steps_executed += self.dispatch_ready(&task, &snapshot, &lifecycle).await?;
                }
                ExecutionStatus::Processing => {
                    tokio::time::sleep(poll.next_wait()).await;
                }
                ExecutionStatus::WaitingForDependencies => {
                    let wait = snapshot
                        .context
                        .next_retry_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or_else(|| poll.next_wait())
                        .min(self.config.max_poll_interval)
                        .max(MIN_POLL_WAIT);
                    debug!(
                        task_id = %task_id,
                        wait_ms = wait.as_millis() as u64,
                        "Waiting for step backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Skip bypassed steps and execute the rest of the ready set
    async fn dispatch_ready(
        &self,
        task: &Task,
        snapshot: &TaskSnapshot,
        lifecycle: &Arc<dyn StepLifecycle>,
    ) -> OrchestrationResult<usize> {
        let (bypassed, ready): (Vec<WorkflowStep>, Vec<WorkflowStep>) = snapshot
            .ready_steps()
            .into_iter()
            .partition(|step| step.skippable && task.is_bypassed(&step.name));

        for step in &bypassed {
            self.bypass_step(step).await?;
        }
        if !bypassed.is_empty() {
            start_task(&self.task_state_machine, task.task_id, "bypass").await;
        }
        if ready.is_empty() {
            return Ok(0);
        }

        let outcomes = self
            .executor
            .execute_batch(Arc::clone(lifecycle), ready)
            .await;

        let mut executed = 0;
        let mut storage_error = None;
        for (step_id, outcome) in outcomes {
            match outcome {
                outcome if outcome.was_executed() => executed += 1,
                StepExecutionOutcome::StorageError(reason) => {
                    storage_error.get_or_insert((step_id, reason));
                }
                StepExecutionOutcome::Aborted(reason) => {
                    warn!(step_id = %step_id, reason = %reason, "Step execution aborted");
                }
                _ => {}
            }
        }

        if let Some((step_id, reason)) = storage_error {
            log_error(
                "workflow_coordinator",
                "dispatch_ready",
                &reason,
                Some(&format!("step {step_id}")),
            );
            return Err(OrchestrationError::database(
                format!("execute step {step_id}"),
                reason,
            ));
        }
        Ok(executed)
    }

    async fn bypass_step(&self, step: &WorkflowStep) -> OrchestrationResult<()> {
        let transition = self
            .step_state_machine
            .transition(
                step,
                StepEvent::Skip,
                json!({ "reason": "bypassed" }),
                StepUpdate::new().processed_at(Utc::now()),
            )
            .await;
        match transition {
            Ok(_) => {
                log_step_operation(
                    "bypass_step",
                    Some(step.task_id),
                    Some(step.workflow_step_id),
                    Some(&step.name),
                    "skipped",
                    None,
                );
                Ok(())
            }
            Err(e) if e.is_rejection() => Ok(()),
            Err(e) => Err(transition_error("step", step.workflow_step_id, e)),
        }
    }

    /// Fail abandoned claims and apply interrupted retries; returns how many steps moved
    async fn recover(
        &self,
        snapshot: &TaskSnapshot,
        template: &RegisteredTemplate,
    ) -> OrchestrationResult<usize> {
        let mut recovered = 0;

        let stale_timeout = chrono::Duration::from_std(self.config.stale_claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = snapshot.evaluated_at - stale_timeout;
        for step in snapshot.stale_claims(cutoff) {
            warn!(
                step_id = %step.workflow_step_id,
                step_name = %step.name,
                last_attempted_at = ?step.last_attempted_at,
                "Recovering abandoned step claim"
            );
            let error = StepHandlerError::retryable(format!(
                "Step claim expired after {}s without a recorded outcome",
                self.config.stale_claim_timeout.as_secs()
            ))
            .with_error_code(CLAIM_EXPIRED_ERROR_CODE);
            let retry = template
                .step_definition(&step.name)
                .map(|d| d.retry.clone())
                .unwrap_or_default();
            let outcome = self
                .result_processor
                .fail(&step, &retry, &error, step.attempts + 1)
                .await?;
            if outcome != StepExecutionOutcome::Superseded {
                recovered += 1;
            }
        }

        for step in snapshot.steps_in_state(WorkflowStepState::Error) {
            if self.result_processor.resume_interrupted_retry(&step).await? {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn failed_result(&self, task_id: Uuid) -> OrchestrationResult<TaskOrchestrationResult> {
        let context = self.discovery.execution_context(task_id).await?;
        let error = self
            .store
            .task_transitions(task_id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.to_state == TaskState::Error)
            .and_then(|t| t.metadata.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| "Task failed".to_string());

        Ok(TaskOrchestrationResult::Failed {
            task_id,
            error,
            failed_steps: context.failed_step_details,
        })
    }

    /// Cancel a task and every step that has not started.
    ///
    /// In-flight steps finish and record their outcome, but nothing new is
    /// dispatched. Returns the number of steps cancelled.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn cancel_task(&self, task_id: Uuid, reason: &str) -> OrchestrationResult<usize> {
        self.task_operation(
            task_id,
            TaskEvent::Cancel,
            json!({ "reason": reason }),
            &[TaskState::Pending, TaskState::InProgress, TaskState::Error],
        )
        .await?;

        let mut cancelled = 0;
        for step in self.store.list_steps(task_id).await? {
            if !CANCELLABLE_STEP_STATES.contains(&step.current_state) {
                continue;
            }
            match self
                .step_state_machine
                .transition(
                    &step,
                    StepEvent::Cancel,
                    json!({ "reason": reason }),
                    StepUpdate::new(),
                )
                .await
            {
                Ok(_) => cancelled += 1,
                Err(e) if e.is_rejection() => {}
                Err(e) => return Err(transition_error("step", step.workflow_step_id, e)),
            }
        }

        log_task_operation(
            "cancel_task",
            Some(task_id),
            None,
            None,
            "cancelled",
            Some(&format!("{cancelled} steps cancelled: {reason}")),
        );
        Ok(cancelled)
    }

    /// Operator resolution of a failed task (`error -> resolved_manually`)
    pub async fn resolve_task_manually(&self, task_id: Uuid, reason: &str) -> OrchestrationResult<()> {
        self.task_operation(
            task_id,
            TaskEvent::ResolveManually,
            manual_resolution_metadata(reason),
            &[TaskState::Error],
        )
        .await?;
        log_task_operation(
            "resolve_task_manually",
            Some(task_id),
            None,
            None,
            "resolved_manually",
            Some(reason),
        );
        Ok(())
    }

    /// Operator resolution of a failed step; the step then satisfies its dependents
    pub async fn resolve_step_manually(
        &self,
        step_id: Uuid,
        reason: &str,
    ) -> OrchestrationResult<WorkflowStep> {
        let step = self.store.get_step(step_id).await?;
        let resolved = self
            .step_state_machine
            .transition(
                &step,
                StepEvent::ResolveManually,
                manual_resolution_metadata(reason),
                StepUpdate::new().processed_at(Utc::now()),
            )
            .await
            .map_err(|e| {
                if e.is_rejection() {
                    OrchestrationError::InvalidStepState {
                        step_id,
                        current_state: step.current_state.to_string(),
                        expected_states: vec![WorkflowStepState::Error.to_string()],
                    }
                } else {
                    transition_error("step", step_id, e)
                }
            })?;

        log_step_operation(
            "resolve_step_manually",
            Some(resolved.task_id),
            Some(step_id),
            Some(&resolved.name),
            "resolved_manually",
            Some(reason),
        );
        Ok(resolved)
    }

    /// Move a failed task back to `pending` so `execute_task` can resume it
    pub async fn reset_task(&self, task_id: Uuid, reason: &str) -> OrchestrationResult<()> {
        self.task_operation(
            task_id,
            TaskEvent::Reset,
            json!({ "reason": reason }),
            &[TaskState::Error],
        )
        .await?;
        log_task_operation("reset_task", Some(task_id), None, None, "pending", Some(reason));
        Ok(())
    }

    /// Status counts and failed-step triage details
    pub async fn task_execution_context(
        &self,
        task_id: Uuid,
    ) -> OrchestrationResult<TaskExecutionContext> {
        self.discovery.execution_context(task_id).await
    }

    /// Operator task transition; a rejected transition reports the task's state
    async fn task_operation(
        &self,
        task_id: Uuid,
        event: TaskEvent,
        metadata: serde_json::Value,
        expected: &[TaskState],
    ) -> OrchestrationResult<TaskState> {
        match self
            .task_state_machine
            .transition(task_id, event, metadata)
            .await
        {
            Ok(state) => Ok(state),
            Err(e) if e.is_rejection() => {
                let current = self.store.get_task_state(task_id).await?;
                Err(OrchestrationError::InvalidTaskState {
                    task_id,
                    current_state: current.to_string(),
                    expected_states: expected.iter().map(|s| s.to_string()).collect(),
                })
            }
            Err(e) => Err(transition_error("task", task_id, e)),
        }
    }
}

/// Move the task to `in_progress` if it is still `pending`; losing the race is fine
async fn start_task(task_state_machine: &TaskStateMachine, task_id: Uuid, triggered_by: &str) {
    match task_state_machine
        .transition(task_id, TaskEvent::Start, json!({ "triggered_by": triggered_by }))
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_rejection() => {}
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to mark task in progress"),
    }
}

/// Claims and records steps of one task on behalf of the executor
struct TaskStepLifecycle {
    task: Arc<Task>,
    template: Arc<RegisteredTemplate>,
    store: Arc<dyn TaskStore>,
    step_state_machine: StepStateMachine,
    task_state_machine: TaskStateMachine,
    result_processor: StepResultProcessor,
    default_timeout: Duration,
}

impl TaskStepLifecycle {
    /// Cancel a step claimed after its task left the active states
    async fn release_claim(
        &self,
        claimed: &WorkflowStep,
        task_state: TaskState,
    ) -> OrchestrationResult<()> {
        let transition = self
            .step_state_machine
            .transition(
                claimed,
                StepEvent::Cancel,
                json!({ "reason": "task no longer active at claim", "task_state": task_state.as_str() }),
                StepUpdate::new(),
            )
            .await;
        match transition {
            Ok(_) => {
                info!(
                    task_id = %claimed.task_id,
                    step_id = %claimed.workflow_step_id,
                    step_name = %claimed.name,
                    task_state = %task_state,
                    "Released claim on inactive task"
                );
                Ok(())
            }
            Err(e) if e.is_rejection() => Ok(()),
            Err(e) => Err(transition_error("step", claimed.workflow_step_id, e)),
        }
    }
}

#[async_trait]
impl StepLifecycle for TaskStepLifecycle {
    async fn claim(&self, step: &WorkflowStep) -> OrchestrationResult<Option<ClaimedStep>> {
        let task_id = self.task.task_id;
        let task_state = self.store.get_task_state(task_id).await?;
        if !matches!(task_state, TaskState::Pending | TaskState::InProgress) {
            debug!(task_id = %task_id, state = %task_state, "Task no longer active; not claiming");
            return Ok(None);
        }

        let definition = self.template.step_definition(&step.name).ok_or_else(|| {
            OrchestrationError::StepHandlerNotFound {
                step_name: step.name.clone(),
                callable: "<undeclared step>".to_string(),
            }
        })?;
        let handler = self.template.handler_for(&step.name).ok_or_else(|| {
            OrchestrationError::StepHandlerNotFound {
                step_name: step.name.clone(),
                callable: definition.handler.callable.clone(),
            }
        })?;

        let steps = self.store.list_steps(task_id).await?;
        let edges = self.store.list_edges(task_id).await?;
        let Some(current) = steps
            .iter()
            .find(|s| s.workflow_step_id == step.workflow_step_id)
        else {
            return Ok(None);
        };
        if current.current_state != WorkflowStepState::Pending {
            return Ok(None);
        }

        let dependency_results = dependency_results(current, &steps, &edges);
        let sibling_results = sibling_results(current, &steps);
        let update = StepUpdate::new()
            .inputs(inputs_value(&dependency_results))
            .last_attempted_at(Utc::now());

        let claimed = match self
            .step_state_machine
            .transition(
                current,
                StepEvent::Start,
                json!({ "attempt": current.attempts + 1 }),
                update,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) if e.is_rejection() => {
                debug!(step_id = %step.workflow_step_id, reason = %e, "Lost step claim");
                return Ok(None);
            }
            Err(e) => return Err(transition_error("step", step.workflow_step_id, e)),
        };

        // A cancel can land between the task read above and the step claim
        let task_state = self.store.get_task_state(task_id).await?;
        if !matches!(task_state, TaskState::Pending | TaskState::InProgress) {
            self.release_claim(&claimed, task_state).await?;
            return Ok(None);
        }

        if task_state == TaskState::Pending {
            start_task(&self.task_state_machine, task_id, &claimed.name).await;
        }

        let timeout = definition
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        Ok(Some(ClaimedStep {
            context: StepExecutionContext {
                task: Arc::clone(&self.task),
                step: claimed,
                dependency_results,
                sibling_results,
                initialization: definition.handler.initialization.clone(),
            },
            handler,
            timeout,
        }))
    }

    async fn record(
        &self,
        claimed: ClaimedStep,
        outcome: Result<StepHandlerResult, StepHandlerError>,
    ) -> OrchestrationResult<StepExecutionOutcome> {
        let step = &claimed.context.step;
        let retry = self
            .template
            .step_definition(&step.name)
            .map(|d| d.retry.clone())
            .unwrap_or_default();
        self.result_processor.process(step, &retry, outcome).await
    }
}
