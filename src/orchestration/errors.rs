//! # Orchestration Errors
//!
//! Errors the orchestration layer surfaces to its caller. Step-level failures
//! are not here: they are absorbed into step state and never abort the
//! coordinator loop. What does reach the caller is storage trouble, a task in
//! the wrong state for the requested operation, or a missing template or
//! handler.

use crate::error::TaskerError;
use crate::orchestration::dependency_graph::GraphValidationError;
use crate::state_machine::{PersistenceError, StateMachineError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Storage operation failed
    #[error("Database error: {operation} - {reason}")]
    DatabaseError { operation: String, reason: String },

    /// Task is in invalid state for operation
    #[error("Task {task_id} is in invalid state {current_state}, expected one of {expected_states:?}")]
    InvalidTaskState {
        task_id: Uuid,
        current_state: String,
        expected_states: Vec<String>,
    },

    /// Step is in invalid state for operation
    #[error("Step {step_id} is in invalid state {current_state}, expected one of {expected_states:?}")]
    InvalidStepState {
        step_id: Uuid,
        current_state: String,
        expected_states: Vec<String>,
    },

    #[error("{entity_type} {entity_id} not found")]
    NotFound {
        entity_type: &'static str,
        entity_id: String,
    },

    /// State transition failed
    #[error("State transition failed for {entity_type} {entity_id}: {reason}")]
    StateTransitionFailed {
        entity_type: &'static str,
        entity_id: Uuid,
        reason: String,
    },

    /// No template registered under the requested identity
    #[error("Task template not found for namespace {namespace}, name {name}, version {version}")]
    TemplateNotFound {
        namespace: String,
        name: String,
        version: String,
    },

    /// Step callable was not resolved at registration
    #[error("Step handler '{callable}' not found for step {step_name}")]
    StepHandlerNotFound { step_name: String, callable: String },

    #[error("Invalid task request: {reason}")]
    InvalidRequest { reason: String },

    #[error(transparent)]
    GraphValidation(#[from] GraphValidationError),

    #[error("Registry error: {0}")]
    Registry(String),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

impl OrchestrationError {
    pub fn database(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is a storage failure, as opposed to a caller error
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl From<PersistenceError> for OrchestrationError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound {
                entity_type,
                entity_id,
            } => Self::NotFound {
                entity_type,
                entity_id,
            },
            other => Self::database("persistence", other),
        }
    }
}

impl From<TaskerError> for OrchestrationError {
    fn from(err: TaskerError) -> Self {
        match err {
            TaskerError::DatabaseError(reason) => Self::database("store", reason),
            TaskerError::InvalidInput(reason) | TaskerError::ValidationError(reason) => {
                Self::InvalidRequest { reason }
            }
            other => Self::Registry(other.to_string()),
        }
    }
}

/// Map a state machine failure on a given entity.
///
/// Persistence failures other than a lost race stay storage errors so they
/// reach the caller as such.
pub(crate) fn transition_error(
    entity_type: &'static str,
    entity_id: Uuid,
    err: StateMachineError,
) -> OrchestrationError {
    match err {
        StateMachineError::Persistence(PersistenceError::ConcurrentModification { .. }) => {
            OrchestrationError::StateTransitionFailed {
                entity_type,
                entity_id,
                reason: err.to_string(),
            }
        }
        StateMachineError::Persistence(inner) => inner.into(),
        other => OrchestrationError::StateTransitionFailed {
            entity_type,
            entity_id,
            reason: other.to_string(),
        },
    }
}

impl From<OrchestrationError> for TaskerError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::DatabaseError { .. } => TaskerError::DatabaseError(err.to_string()),
            OrchestrationError::NotFound { .. } | OrchestrationError::TemplateNotFound { .. } => {
                TaskerError::NotFound(err.to_string())
            }
            OrchestrationError::InvalidRequest { reason } => TaskerError::InvalidInput(reason),
            OrchestrationError::GraphValidation(inner) => inner.into(),
            OrchestrationError::StateTransitionFailed { .. }
            | OrchestrationError::InvalidTaskState { .. }
            | OrchestrationError::InvalidStepState { .. } => {
                TaskerError::StateTransitionError(err.to_string())
            }
            OrchestrationError::StepHandlerNotFound { .. } | OrchestrationError::Registry(_) => {
                TaskerError::RegistryError(err.to_string())
            }
        }
    }
}
