//! # System Constants
//!
//! Core constants and enums that define the operational boundaries of the
//! orchestration engine: lifecycle event names, execution status values used
//! for orchestration decisions, and status groupings.

use serde::{Deserialize, Serialize};

pub use crate::state_machine::{TaskState as TaskStatus, WorkflowStepState as WorkflowStepStatus};

/// Lifecycle event names published on every task and step transition
pub mod events {
    // Task lifecycle events
    pub const TASK_INITIALIZED: &str = "task.initialized";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RESOLVED_MANUALLY: &str = "task.resolved_manually";
    pub const TASK_RESET: &str = "task.reset";

    // Step lifecycle events
    pub const STEP_INITIALIZED: &str = "step.initialized";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";
    pub const STEP_CANCELLED: &str = "step.cancelled";
    pub const STEP_RESOLVED_MANUALLY: &str = "step.resolved_manually";
    pub const STEP_RETRY_SCHEDULED: &str = "step.retry_scheduled";
}

/// Task execution context states for orchestration decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    HasReadySteps,
    Processing,
    BlockedByFailures,
    AllComplete,
    WaitingForDependencies,
}

/// Recommended orchestration actions based on task analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ExecuteReadySteps,
    WaitForCompletion,
    HandleFailures,
    FinalizeTask,
    WaitForDependencies,
}

/// System-wide constants
pub mod system {
    /// Default edge name for workflow dependencies
    pub const PROVIDES_EDGE_NAME: &str = "provides";

    /// Version assumed when a template or request does not carry one
    pub const DEFAULT_TASK_VERSION: &str = "0.1.0";

    /// Default namespace for templates that do not declare one
    pub const DEFAULT_NAMESPACE: &str = "default";

    /// Maximum dependency depth accepted when none is configured
    pub const MAX_DEPENDENCY_DEPTH: usize = 50;

    /// Maximum number of steps in a single workflow
    pub const MAX_WORKFLOW_STEPS: usize = 1000;

    /// Error code recorded when an in-flight claim is abandoned
    pub const CLAIM_EXPIRED_ERROR_CODE: &str = "claim_expired";

    /// Error code recorded when a step handler exceeds its execution timeout
    pub const STEP_TIMEOUT_ERROR_CODE: &str = "step_timeout";

    /// Error code recorded when a step handler panics
    pub const HANDLER_PANIC_ERROR_CODE: &str = "handler_panic";

    /// Error code recorded when a handler skips a step that is not skippable
    pub const SKIP_NOT_ALLOWED_ERROR_CODE: &str = "skip_not_allowed";
}

/// Status groupings for validation and logic
pub mod status_groups {
    use super::{TaskStatus, WorkflowStepStatus};

    /// Step states that satisfy a dependent's dependency predicate
    pub const DEPENDENCY_SATISFYING_STEP_STATES: &[WorkflowStepStatus] = &[
        WorkflowStepStatus::Complete,
        WorkflowStepStatus::Skipped,
        WorkflowStepStatus::ResolvedManually,
    ];

    /// Step states that can never lead to a dependency being satisfied
    pub const BLOCKING_STEP_STATES: &[WorkflowStepStatus] =
        &[WorkflowStepStatus::Error, WorkflowStepStatus::Cancelled];

    /// Step states an operator cancellation can move to `cancelled`
    pub const CANCELLABLE_STEP_STATES: &[WorkflowStepStatus] =
        &[WorkflowStepStatus::Pending, WorkflowStepStatus::Error];

    /// Task statuses that indicate final completion
    pub const TASK_FINAL_STATES: &[TaskStatus] = &[
        TaskStatus::Complete,
        TaskStatus::Cancelled,
        TaskStatus::ResolvedManually,
    ];

    /// Task statuses that still participate in identity deduplication
    pub const TASK_ACTIVE_STATES: &[TaskStatus] =
        &[TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Error];
}

impl ExecutionStatus {
    /// Check if this status indicates active work is happening
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Processing | ExecutionStatus::HasReadySteps
        )
    }

    /// Check if this status indicates completion
    pub fn is_complete(&self) -> bool {
        matches!(self, ExecutionStatus::AllComplete)
    }

    /// Action an orchestrator should take for this status
    pub fn recommended_action(&self) -> RecommendedAction {
        match self {
            ExecutionStatus::HasReadySteps => RecommendedAction::ExecuteReadySteps,
            ExecutionStatus::Processing => RecommendedAction::WaitForCompletion,
            ExecutionStatus::BlockedByFailures => RecommendedAction::HandleFailures,
            ExecutionStatus::AllComplete => RecommendedAction::FinalizeTask,
            ExecutionStatus::WaitingForDependencies => RecommendedAction::WaitForDependencies,
        }
    }
}
