//! Configuration errors.

use crate::error::TaskerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A loaded value is outside what the engine can run with
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Layering files and environment variables failed, or the result did not deserialize
    #[error("Failed to load layered configuration for '{environment}': {error}")]
    LoadError { environment: String, error: String },
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    pub fn load_error(environment: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::LoadError {
            environment: environment.into(),
            error: error.to_string(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

impl From<ConfigurationError> for TaskerError {
    fn from(err: ConfigurationError) -> Self {
        TaskerError::ConfigurationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_message() {
        let err = ConfigurationError::invalid_value("execution.max_concurrent_steps", 0, "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid value '0' for field 'execution.max_concurrent_steps': must be at least 1"
        );
        let tasker: TaskerError = err.into();
        assert!(matches!(tasker, TaskerError::ConfigurationError(_)));
    }
}
