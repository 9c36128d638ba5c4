use crate::error::TaskerError;
use thiserror::Error;

/// Comprehensive error types for state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {0}")]
    GuardFailed(#[from] GuardError),

    #[error("Invalid state transition from {from:?} on {event}")]
    InvalidTransition { from: Option<String>, event: String },

    #[error("Action execution failed: {reason}")]
    ActionFailed { reason: String },

    #[error("Persistence operation failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StateMachineError {
    /// A compare-and-set lost to a concurrent writer
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(
            self,
            Self::Persistence(PersistenceError::ConcurrentModification { .. })
        )
    }

    /// Whether the transition was refused on its own terms rather than by storage
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::GuardFailed(_) | Self::InvalidTransition { .. })
            || self.is_concurrent_modification()
    }
}

/// Specific error type for guard condition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Dependencies not satisfied: {reason}")]
    DependenciesNotMet { reason: String },

    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Invalid state for guard check: {state}")]
    InvalidState { state: String },
}

/// Failure of a post-transition action. The transition itself stays persisted.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Action '{action}' failed: {reason}")]
    ExecutionFailed { action: &'static str, reason: String },
}

impl ActionError {
    pub fn execution_failed(action: &'static str, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            action,
            reason: reason.into(),
        }
    }
}

/// Specific error type for persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        entity_type: &'static str,
        entity_id: String,
    },

    #[error("Concurrent modification detected for entity {entity_id}: expected {expected}, found {actual}")]
    ConcurrentModification {
        entity_id: String,
        expected: String,
        actual: String,
    },

    #[error("Failed to save transition: {reason}")]
    TransitionSaveFailed { reason: String },

    #[error("Invalid transition data: {field}")]
    InvalidTransitionData { field: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn task_not_found(task_id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: "Task",
            entity_id: task_id.to_string(),
        }
    }

    pub fn step_not_found(step_id: impl ToString) -> Self {
        Self::NotFound {
            entity_type: "WorkflowStep",
            entity_id: step_id.to_string(),
        }
    }

    pub fn concurrent_modification(
        entity_id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ConcurrentModification {
            entity_id: entity_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<ActionError> for StateMachineError {
    fn from(err: ActionError) -> Self {
        Self::ActionFailed {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for state machine operations
pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;
pub type ActionResult<T> = Result<T, ActionError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Helper function to create guard dependency errors
pub fn dependencies_not_met(reason: impl Into<String>) -> GuardError {
    GuardError::DependenciesNotMet {
        reason: reason.into(),
    }
}

/// Helper function to create business rule violations
pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}

impl From<StateMachineError> for TaskerError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::Persistence(inner) => inner.into(),
            StateMachineError::GuardFailed(inner) => inner.into(),
            StateMachineError::InvalidTransition { .. } => {
                TaskerError::StateTransitionError(err.to_string())
            }
            other => TaskerError::StateMachineError(other.to_string()),
        }
    }
}

impl From<GuardError> for TaskerError {
    fn from(err: GuardError) -> Self {
        TaskerError::StateMachineGuardError(format!("{err}"))
    }
}

impl From<ActionError> for TaskerError {
    fn from(err: ActionError) -> Self {
        TaskerError::StateMachineError(format!("{err}"))
    }
}

impl From<PersistenceError> for TaskerError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound { .. } => TaskerError::NotFound(err.to_string()),
            PersistenceError::Database(reason) => TaskerError::DatabaseError(reason),
            other => TaskerError::StateMachinePersistenceError(other.to_string()),
        }
    }
}
