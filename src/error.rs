//! Error types for the Tasker engine.
//!
//! `TaskerError` is what crosses the public API. Component errors
//! (state machine, persistence, orchestration, graph validation, configuration)
//! keep their own enums and fold into it through `From`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Event error: {0}")]
    EventError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Graph validation error: {0}")]
    GraphValidationError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Registry error: {0}")]
    RegistryError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("State machine error: {0}")]
    StateMachineError(String),
    #[error("State machine guard error: {0}")]
    StateMachineGuardError(String),
    #[error("State machine persistence error: {0}")]
    StateMachinePersistenceError(String),
}

impl From<serde_json::Error> for TaskerError {
    fn from(error: serde_json::Error) -> Self {
        TaskerError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<serde_yaml::Error> for TaskerError {
    fn from(error: serde_yaml::Error) -> Self {
        TaskerError::ValidationError(format!("YAML parsing error: {error}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for TaskerError {
    fn from(err: sqlx::Error) -> Self {
        TaskerError::DatabaseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
