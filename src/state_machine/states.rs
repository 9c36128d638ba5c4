use crate::constants::status_groups::{
    BLOCKING_STEP_STATES, DEPENDENCY_SATISFYING_STEP_STATES, TASK_FINAL_STATES,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Initial state when task is created
    #[default]
    Pending,
    /// At least one step has been started
    InProgress,
    /// Every step satisfied its dependents
    Complete,
    /// No further progress is possible without intervention
    Error,
    /// Task was cancelled
    Cancelled,
    /// Task was manually resolved by operator
    ResolvedManually,
}

impl TaskState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        TASK_FINAL_STATES.contains(self)
    }

    /// Check if this is an error state that may allow recovery
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Check if this is an active state (task is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::ResolvedManually => "resolved_manually",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            "resolved_manually" => Ok(Self::ResolvedManually),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// Workflow step lifecycle states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepState {
    /// Initial state, and the state a retry returns to
    #[default]
    Pending,
    /// Claimed by a coordinator; handler running
    InProgress,
    /// Step completed successfully
    Complete,
    /// Step failed; may return to pending if retries remain
    Error,
    /// Step was skipped; satisfies dependents like a completion
    Skipped,
    /// Step was cancelled
    Cancelled,
    /// Step was manually resolved by operator
    ResolvedManually,
}

impl WorkflowStepState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Skipped | Self::Cancelled | Self::ResolvedManually
        )
    }

    /// Check if this is an error state that may allow recovery
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Check if this is an active state (step is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if this step satisfies dependencies for other steps
    pub fn satisfies_dependencies(&self) -> bool {
        DEPENDENCY_SATISFYING_STEP_STATES.contains(self)
    }

    /// A dependency resting here keeps its dependents from ever becoming ready
    pub fn blocks_dependents(&self) -> bool {
        BLOCKING_STEP_STATES.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::ResolvedManually => "resolved_manually",
        }
    }
}

impl fmt::Display for WorkflowStepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            "resolved_manually" => Ok(Self::ResolvedManually),
            _ => Err(format!("Invalid workflow step state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal_check() {
        assert!(TaskState::Complete.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::ResolvedManually.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
        assert!(!TaskState::Error.is_terminal());
    }

    #[test]
    fn test_step_state_dependency_satisfaction() {
        assert!(WorkflowStepState::Complete.satisfies_dependencies());
        assert!(WorkflowStepState::Skipped.satisfies_dependencies());
        assert!(WorkflowStepState::ResolvedManually.satisfies_dependencies());
        assert!(!WorkflowStepState::Pending.satisfies_dependencies());
        assert!(!WorkflowStepState::InProgress.satisfies_dependencies());
        assert!(!WorkflowStepState::Error.satisfies_dependencies());
        assert!(!WorkflowStepState::Cancelled.satisfies_dependencies());
    }

    #[test]
    fn test_step_error_is_not_terminal() {
        assert!(!WorkflowStepState::Error.is_terminal());
        assert!(WorkflowStepState::Error.blocks_dependents());
        assert!(WorkflowStepState::Skipped.is_terminal());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(TaskState::InProgress.to_string(), "in_progress");
        assert_eq!("complete".parse::<TaskState>().unwrap(), TaskState::Complete);

        assert_eq!(WorkflowStepState::Skipped.to_string(), "skipped");
        assert_eq!(
            "resolved_manually".parse::<WorkflowStepState>().unwrap(),
            WorkflowStepState::ResolvedManually
        );
        assert!("bogus".parse::<WorkflowStepState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let task_state = TaskState::InProgress;
        let json = serde_json::to_string(&task_state).unwrap();
        assert_eq!(json, "\"in_progress\"");

        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task_state);
    }
}
