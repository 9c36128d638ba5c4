//! # Task Finalizer
//!
//! Moves a task to its terminal state once the execution context says no
//! further progress is possible:
//!
//! - every step satisfied (`complete`, `skipped` or `resolved_manually`) -> `complete`
//! - nothing ready, in flight or waiting on a backoff, with failures -> `error`
//!
//! The `error` transition records which steps failed, with their
//! classification, attempts and exhaustion, so an operator can triage from the
//! audit trail alone. Another coordinator finalizing the same task first is
//! not an error.

use crate::constants::ExecutionStatus;
use crate::database::TaskStore;
use crate::models::{FailedStepSummary, TaskExecutionContext};
use crate::orchestration::errors::{transition_error, OrchestrationResult};
use crate::orchestration::types::FinalizationAction;
use crate::orchestration::viable_step_discovery::ViableStepDiscovery;
use crate::state_machine::{TaskEvent, TaskState, TaskStateMachine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of task finalization operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationResult {
    pub task_id: Uuid,
    pub action: FinalizationAction,
    /// Task state after finalization
    pub task_state: TaskState,
    pub completion_percentage: f64,
    pub failed_steps: Vec<FailedStepSummary>,
}

#[derive(Debug, Clone)]
pub struct TaskFinalizer {
    store: Arc<dyn TaskStore>,
    task_state_machine: TaskStateMachine,
    discovery: ViableStepDiscovery,
}

impl TaskFinalizer {
    pub fn new(store: Arc<dyn TaskStore>, task_state_machine: TaskStateMachine) -> Self {
        let discovery = ViableStepDiscovery::new(Arc::clone(&store));
        Self {
            store,
            task_state_machine,
            discovery,
        }
    }

    /// Finalize the task if `context` shows it can make no further progress
    #[instrument(skip(self, context), fields(task_id = %context.task_id))]
    pub async fn finalize(
        &self,
        context: &TaskExecutionContext,
    ) -> OrchestrationResult<FinalizationResult> {
        let task_id = context.task_id;
        match context.execution_status {
            ExecutionStatus::AllComplete => self.complete_task(context).await,
            ExecutionStatus::BlockedByFailures => self.fail_task(context).await,
            _ => Ok(FinalizationResult {
                task_id,
                action: FinalizationAction::NoAction,
                task_state: context.status,
                completion_percentage: context.completion_percentage,
                failed_steps: Vec::new(),
            }),
        }
    }

    async fn complete_task(
        &self,
        context: &TaskExecutionContext,
    ) -> OrchestrationResult<FinalizationResult> {
        let metadata = json!({
            "total_steps": context.total_steps,
            "completed_steps": context.completed_steps,
            "skipped_steps": context.skipped_steps,
            "resolved_steps": context.resolved_steps,
        });
        let transition = self
            .task_state_machine
            .transition(context.task_id, TaskEvent::Complete, metadata)
            .await;

        match transition {
            Ok(state) => {
                info!(
                    task_id = %context.task_id,
                    total_steps = context.total_steps,
                    "Task completed"
                );
                Ok(self.result(context, FinalizationAction::Completed, state, Vec::new()))
            }
            Err(e) if e.is_rejection() => self.already_final(context, e.to_string()).await,
            Err(e) => Err(transition_error("task", context.task_id, e)),
        }
    }

    async fn fail_task(
        &self,
        context: &TaskExecutionContext,
    ) -> OrchestrationResult<FinalizationResult> {
        let steps = self.store.list_steps(context.task_id).await?;
        let failed_steps = self.discovery.failed_step_details(&steps).await?;

        let summary = failed_steps
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let reason = if failed_steps.is_empty() {
            "Task blocked: no step can make progress".to_string()
        } else {
            format!("Task blocked by failed steps: {summary}")
        };
        let metadata = json!({
            "failed_steps": failed_steps,
            "blocked_steps": context.blocked_steps,
            "cancelled_steps": context.cancelled_steps,
        });

        let transition = self
            .task_state_machine
            .transition(context.task_id, TaskEvent::fail_with_error(reason), metadata)
            .await;

        match transition {
            Ok(state) => {
                warn!(
                    task_id = %context.task_id,
                    failed_steps = failed_steps.len(),
                    blocked_steps = context.blocked_steps,
                    "Task failed"
                );
                Ok(self.result(context, FinalizationAction::Failed, state, failed_steps))
            }
            Err(e) if e.is_rejection() => self.already_final(context, e.to_string()).await,
            Err(e) => Err(transition_error("task", context.task_id, e)),
        }
    }

    /// A rejected finalization: report whatever state the task is now in
    async fn already_final(
        &self,
        context: &TaskExecutionContext,
        reason: String,
    ) -> OrchestrationResult<FinalizationResult> {
        let state = self.store.get_task_state(context.task_id).await?;
        info!(
            task_id = %context.task_id,
            state = %state,
            reason = %reason,
            "Task finalization skipped"
        );
        let action = if state.is_terminal() || state == TaskState::Error {
            FinalizationAction::AlreadyFinal
        } else {
            FinalizationAction::NoAction
        };
        Ok(self.result(context, action, state, Vec::new()))
    }

    fn result(
        &self,
        context: &TaskExecutionContext,
        action: FinalizationAction,
        task_state: TaskState,
        failed_steps: Vec<FailedStepSummary>,
    ) -> FinalizationResult {
        FinalizationResult {
            task_id: context.task_id,
            action,
            task_state,
            completion_percentage: context.completion_percentage,
            failed_steps,
        }
    }
}
