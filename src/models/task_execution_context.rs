//! # Task Execution Context
//!
//! Computed, never stored: a snapshot of one task's execution state derived
//! from its step readiness. It answers the questions the coordinator and an
//! operator both ask:
//!
//! - How far along is the task? (step counts, completion percentage)
//! - What can run right now? (ready steps)
//! - Is anything stuck? (blocked steps, failed steps with their triage details)
//! - What should happen next? (execution status, recommended action)
//!
//! The derivation of [`ExecutionStatus`] is the stall rule of the coordinator:
//! once nothing is ready, in flight, or waiting on a backoff deadline, the task
//! can make no further progress on its own and is blocked by failures.

use crate::constants::{ExecutionStatus, RecommendedAction};
use crate::models::step_readiness::StepReadinessStatus;
use crate::models::transitions::WorkflowStepTransition;
use crate::models::workflow_step::WorkflowStep;
use crate::state_machine::{TaskState, WorkflowStepState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionContext {
    pub task_id: Uuid,
    pub status: TaskState,
    pub total_steps: usize,
    pub pending_steps: usize,
    pub in_progress_steps: usize,
    pub completed_steps: usize,
    pub skipped_steps: usize,
    pub resolved_steps: usize,
    pub failed_steps: usize,
    pub cancelled_steps: usize,
    pub ready_steps: usize,
    pub blocked_steps: usize,
    pub waiting_for_backoff_steps: usize,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub execution_status: ExecutionStatus,
    pub recommended_action: RecommendedAction,
    pub completion_percentage: f64,
    pub failed_step_details: Vec<FailedStepSummary>,
}

/// Triage details for a step resting in `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStepSummary {
    pub workflow_step_id: Uuid,
    pub name: String,
    pub attempts: i32,
    pub retry_limit: i32,
    /// `retryable` or `permanent`, as recorded on the failing transition
    pub classification: Option<String>,
    /// Retryable failure whose attempt budget is consumed
    pub exhausted: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl FailedStepSummary {
    /// Build from the step and its most recent transition
    pub fn from_step(step: &WorkflowStep, last_transition: Option<&WorkflowStepTransition>) -> Self {
        Self {
            workflow_step_id: step.workflow_step_id,
            name: step.name.clone(),
            attempts: step.attempts,
            retry_limit: step.retry_limit,
            classification: last_transition
                .and_then(|t| t.metadata_str("classification"))
                .map(str::to_string),
            exhausted: last_transition
                .and_then(|t| t.metadata_bool("exhausted"))
                .unwrap_or(false),
            error_code: last_transition
                .and_then(|t| t.metadata_str("error_code"))
                .map(str::to_string),
            error_message: last_transition
                .and_then(|t| t.metadata_str("error"))
                .map(str::to_string),
        }
    }
}

impl TaskExecutionContext {
    pub fn from_readiness(task_id: Uuid, status: TaskState, readiness: &[StepReadinessStatus]) -> Self {
        let mut ctx = Self {
            task_id,
            status,
            total_steps: readiness.len(),
            pending_steps: 0,
            in_progress_steps: 0,
            completed_steps: 0,
            skipped_steps: 0,
            resolved_steps: 0,
            failed_steps: 0,
            cancelled_steps: 0,
            ready_steps: 0,
            blocked_steps: 0,
            waiting_for_backoff_steps: 0,
            next_retry_at: None,
            execution_status: ExecutionStatus::AllComplete,
            recommended_action: RecommendedAction::FinalizeTask,
            completion_percentage: 0.0,
            failed_step_details: Vec::new(),
        };

        for step in readiness {
            match step.current_state {
                WorkflowStepState::Pending => {
                    ctx.pending_steps += 1;
                    if step.ready_for_execution {
                        ctx.ready_steps += 1;
                    } else if step.blocked_by_failure {
                        ctx.blocked_steps += 1;
                    } else if step.in_backoff {
                        ctx.waiting_for_backoff_steps += 1;
                        ctx.next_retry_at = match (ctx.next_retry_at, step.next_retry_at) {
                            (Some(current), Some(candidate)) => Some(current.min(candidate)),
                            (current, candidate) => current.or(candidate),
                        };
                    }
                }
                WorkflowStepState::InProgress => ctx.in_progress_steps += 1,
                WorkflowStepState::Complete => ctx.completed_steps += 1,
                WorkflowStepState::Skipped => ctx.skipped_steps += 1,
                WorkflowStepState::ResolvedManually => ctx.resolved_steps += 1,
                WorkflowStepState::Error => ctx.failed_steps += 1,
                WorkflowStepState::Cancelled => ctx.cancelled_steps += 1,
            }
        }

        let satisfied = ctx.completed_steps + ctx.skipped_steps + ctx.resolved_steps;
        ctx.completion_percentage = if ctx.total_steps == 0 {
            100.0
        } else {
            (satisfied as f64 / ctx.total_steps as f64) * 100.0
        };

        ctx.execution_status = if satisfied == ctx.total_steps {
            ExecutionStatus::AllComplete
        } else if ctx.ready_steps > 0 {
            ExecutionStatus::HasReadySteps
        } else if ctx.in_progress_steps > 0 {
            ExecutionStatus::Processing
        } else if ctx.waiting_for_backoff_steps > 0 {
            ExecutionStatus::WaitingForDependencies
        } else if ctx.failed_steps > 0 || ctx.blocked_steps > 0 || ctx.cancelled_steps > 0 {
            ExecutionStatus::BlockedByFailures
        } else {
            ExecutionStatus::WaitingForDependencies
        };
        ctx.recommended_action = ctx.execution_status.recommended_action();
        ctx
    }

    pub fn with_failed_steps(mut self, details: Vec<FailedStepSummary>) -> Self {
        self.failed_step_details = details;
        self
    }

    /// Whether no step can make further progress without intervention
    pub fn is_stalled(&self) -> bool {
        self.execution_status == ExecutionStatus::BlockedByFailures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn status(name: &str, position: i32, state: WorkflowStepState) -> StepReadinessStatus {
        StepReadinessStatus {
            workflow_step_id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            name: name.to_string(),
            position,
            current_state: state,
            dependencies_satisfied: true,
            total_parents: 0,
            completed_parents: 0,
            blocked_by_failure: false,
            in_backoff: false,
            next_retry_at: None,
            ready_for_execution: false,
            attempts: 0,
            retry_limit: 3,
        }
    }

    #[test]
    fn test_zero_steps_is_all_complete() {
        let ctx = TaskExecutionContext::from_readiness(Uuid::nil(), TaskState::Pending, &[]);
        assert_eq!(ctx.execution_status, ExecutionStatus::AllComplete);
        assert_eq!(ctx.completion_percentage, 100.0);
    }

    #[test]
    fn test_ready_steps_take_priority() {
        let mut ready = status("b", 1, WorkflowStepState::Pending);
        ready.ready_for_execution = true;
        let steps = vec![status("a", 0, WorkflowStepState::InProgress), ready];
        let ctx = TaskExecutionContext::from_readiness(Uuid::nil(), TaskState::InProgress, &steps);
        assert_eq!(ctx.execution_status, ExecutionStatus::HasReadySteps);
        assert_eq!(ctx.recommended_action, RecommendedAction::ExecuteReadySteps);
    }

    #[test]
    fn test_backoff_waits_with_earliest_deadline() {
        let now = Utc::now();
        let mut a = status("a", 0, WorkflowStepState::Pending);
        a.in_backoff = true;
        a.next_retry_at = Some(now + Duration::seconds(10));
        let mut b = status("b", 1, WorkflowStepState::Pending);
        b.in_backoff = true;
        b.next_retry_at = Some(now + Duration::seconds(2));

        let ctx = TaskExecutionContext::from_readiness(Uuid::nil(), TaskState::InProgress, &[a, b]);
        assert_eq!(ctx.execution_status, ExecutionStatus::WaitingForDependencies);
        assert_eq!(ctx.next_retry_at, Some(now + Duration::seconds(2)));
    }

    #[test]
    fn test_failure_with_blocked_dependents_is_stalled() {
        let mut blocked = status("b", 1, WorkflowStepState::Pending);
        blocked.blocked_by_failure = true;
        let steps = vec![
            status("a", 0, WorkflowStepState::Error),
            blocked,
            status("c", 2, WorkflowStepState::Complete),
        ];
        let ctx = TaskExecutionContext::from_readiness(Uuid::nil(), TaskState::InProgress, &steps);
        assert!(ctx.is_stalled());
        assert_eq!(ctx.failed_steps, 1);
        assert_eq!(ctx.blocked_steps, 1);
        assert_eq!(ctx.recommended_action, RecommendedAction::HandleFailures);
    }

    #[test]
    fn test_skipped_and_resolved_count_toward_completion() {
        let steps = vec![
            status("a", 0, WorkflowStepState::Complete),
            status("b", 1, WorkflowStepState::Skipped),
            status("c", 2, WorkflowStepState::ResolvedManually),
        ];
        let ctx = TaskExecutionContext::from_readiness(Uuid::nil(), TaskState::InProgress, &steps);
        assert_eq!(ctx.execution_status, ExecutionStatus::AllComplete);
    }
}
