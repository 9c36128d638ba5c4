//! # Viable Step Discovery
//!
//! Reads a task's steps and edges from the store and evaluates readiness in
//! one pass, yielding the ready set and the task execution context the
//! coordinator decides on. It also materializes the inputs a claimed step is
//! handed: the results of its dependencies keyed by step name.

use crate::database::TaskStore;
use crate::models::{
    evaluate_step_readiness, FailedStepSummary, StepReadinessStatus, TaskExecutionContext,
    WorkflowStep, WorkflowStepEdge,
};
use crate::orchestration::errors::OrchestrationResult;
use crate::state_machine::{TaskState, WorkflowStepState};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Steps, edges and readiness of one task at one instant
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub task_state: TaskState,
    pub steps: Vec<WorkflowStep>,
    pub edges: Vec<WorkflowStepEdge>,
    pub readiness: Vec<StepReadinessStatus>,
    pub context: TaskExecutionContext,
    pub evaluated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    /// Steps ready for dispatch, in declaration order
    pub fn ready_steps(&self) -> Vec<WorkflowStep> {
        let by_id: HashMap<Uuid, &WorkflowStep> = self
            .steps
            .iter()
            .map(|step| (step.workflow_step_id, step))
            .collect();
        self.readiness
            .iter()
            .filter(|status| status.ready_for_execution)
            .filter_map(|status| by_id.get(&status.workflow_step_id).map(|s| (*s).clone()))
            .collect()
    }

    /// `in_progress` steps claimed before `cutoff`
    pub fn stale_claims(&self, cutoff: DateTime<Utc>) -> Vec<WorkflowStep> {
        self.steps
            .iter()
            .filter(|step| step.current_state == WorkflowStepState::InProgress)
            .filter(|step| step.last_attempted_at.map_or(true, |at| at < cutoff))
            .cloned()
            .collect()
    }

    pub fn steps_in_state(&self, state: WorkflowStepState) -> Vec<WorkflowStep> {
        self.steps
            .iter()
            .filter(|step| step.current_state == state)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ViableStepDiscovery {
    store: Arc<dyn TaskStore>,
}

impl ViableStepDiscovery {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Load and evaluate the task
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn snapshot(&self, task_id: Uuid) -> OrchestrationResult<TaskSnapshot> {
        let task_state = self.store.get_task_state(task_id).await?;
        let steps = self.store.list_steps(task_id).await?;
        let edges = self.store.list_edges(task_id).await?;
        let now = Utc::now();

        let readiness = evaluate_step_readiness(&steps, &edges, now);
        let context = TaskExecutionContext::from_readiness(task_id, task_state, &readiness);

        debug!(
            task_id = %task_id,
            total_steps = context.total_steps,
            ready_steps = context.ready_steps,
            in_progress_steps = context.in_progress_steps,
            execution_status = ?context.execution_status,
            "Evaluated step readiness"
        );

        Ok(TaskSnapshot {
            task_id,
            task_state,
            steps,
            edges,
            readiness,
            context,
            evaluated_at: now,
        })
    }

    /// Steps ready for dispatch right now
    pub async fn find_viable_steps(&self, task_id: Uuid) -> OrchestrationResult<Vec<WorkflowStep>> {
        Ok(self.snapshot(task_id).await?.ready_steps())
    }

    /// Execution context with triage details for every step in `error`
    pub async fn execution_context(&self, task_id: Uuid) -> OrchestrationResult<TaskExecutionContext> {
        let snapshot = self.snapshot(task_id).await?;
        let failed = self.failed_step_details(&snapshot.steps).await?;
        Ok(snapshot.context.with_failed_steps(failed))
    }

    pub async fn failed_step_details(
        &self,
        steps: &[WorkflowStep],
    ) -> OrchestrationResult<Vec<FailedStepSummary>> {
        let mut details = Vec::new();
        for step in steps
            .iter()
            .filter(|step| step.current_state == WorkflowStepState::Error)
        {
            let last = self.store.last_step_transition(step.workflow_step_id).await?;
            details.push(FailedStepSummary::from_step(step, last.as_ref()));
        }
        Ok(details)
    }
}

/// Results of the direct dependencies of `step`, keyed by dependency name.
///
/// A dependency that finished without results (skipped, manually resolved)
/// maps to `null`.
pub fn dependency_results(
    step: &WorkflowStep,
    steps: &[WorkflowStep],
    edges: &[WorkflowStepEdge],
) -> HashMap<String, Value> {
    let by_id: HashMap<Uuid, &WorkflowStep> =
        steps.iter().map(|s| (s.workflow_step_id, s)).collect();
    edges
        .iter()
        .filter(|edge| edge.to_step_id == step.workflow_step_id)
        .filter_map(|edge| by_id.get(&edge.from_step_id))
        .map(|dep| (dep.name.clone(), dep.results.clone().unwrap_or(Value::Null)))
        .collect()
}

/// Results of every other step that satisfies dependencies and produced output
pub fn sibling_results(step: &WorkflowStep, steps: &[WorkflowStep]) -> HashMap<String, Value> {
    steps
        .iter()
        .filter(|s| s.workflow_step_id != step.workflow_step_id)
        .filter(|s| s.current_state.satisfies_dependencies())
        .filter_map(|s| s.results.clone().map(|results| (s.name.clone(), results)))
        .collect()
}

/// Dependency results as the JSON object stored in the step's `inputs`
pub fn inputs_value(dependency_results: &HashMap<String, Value>) -> Value {
    let mut names: Vec<&String> = dependency_results.keys().collect();
    names.sort();
    let mut map = Map::new();
    for name in names {
        map.insert(name.clone(), dependency_results[name].clone());
    }
    Value::Object(map)
}
