//! # Step Handler Contract
//!
//! The interface user code implements for one step of a workflow. The
//! coordinator hands a handler a [`StepExecutionContext`] (the task, the step,
//! results of its dependencies and of any other completed sibling, plus the
//! template's initialization parameters) and interprets what comes back.
//!
//! Failures are a tagged value, not a type hierarchy: [`StepHandlerError`]
//! carries an [`ErrorClassification`]. Anything that is not already a
//! `StepHandlerError` (an `anyhow::Error`, a database error) converts into a
//! retryable one, since transient faults are the common case.
//!
//! Handlers run at least once per successful step, never exactly once: a crash
//! between the claim and the persisted result re-runs the handler. They must
//! tolerate re-invocation.
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::json;
//! use tasker_engine::orchestration::step_handler::{
//!     StepExecutionContext, StepHandler, StepHandlerError, StepHandlerResult,
//! };
//!
//! struct ChargePayment;
//!
//! #[async_trait]
//! impl StepHandler for ChargePayment {
//!     async fn call(
//!         &self,
//!         ctx: &StepExecutionContext,
//!     ) -> Result<StepHandlerResult, StepHandlerError> {
//!         let order = ctx
//!             .dependency_result("validate_order")
//!             .ok_or_else(|| StepHandlerError::permanent("order was not validated"))?;
//!         Ok(StepHandlerResult::Complete(json!({ "charged": order["total"] })))
//!     }
//! }
//! ```

use crate::models::{Task, WorkflowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed step may be attempted again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    Retryable,
    Permanent,
}

impl ErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure returned by a step handler
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{classification} step failure: {message}")]
pub struct StepHandlerError {
    pub classification: ErrorClassification,
    pub message: String,
    pub error_code: Option<String>,
    /// Recorded on the failing transition for operators
    pub metadata: HashMap<String, Value>,
    /// Server-requested delay before the next attempt, capped by the backoff maximum
    pub retry_after: Option<Duration>,
}

impl StepHandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Retryable, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Permanent, message)
    }

    fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            message: message.into(),
            error_code: None,
            metadata: HashMap::new(),
            retry_after: None,
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.classification.is_retryable()
    }
}

impl From<anyhow::Error> for StepHandlerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StepHandlerError>() {
            Ok(classified) => classified,
            Err(err) => Self::retryable(format!("{err:#}")),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StepHandlerError {
    fn from(err: sqlx::Error) -> Self {
        Self::retryable(err.to_string()).with_error_code("database_error")
    }
}

/// Successful handler outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepHandlerResult {
    /// Step finished; the value is persisted as the step's results
    Complete(Value),
    /// Step chose not to run; only valid for skippable steps
    Skipped { reason: String },
}

impl StepHandlerResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Everything a handler is given for one invocation
#[derive(Debug, Clone)]
pub struct StepExecutionContext {
    pub task: Arc<Task>,
    /// The claimed step; `attempts` counts attempts before this one
    pub step: WorkflowStep,
    /// Results of direct dependencies, keyed by step name
    pub dependency_results: HashMap<String, Value>,
    /// Results of every step of the task that had completed at claim time
    pub sibling_results: HashMap<String, Value>,
    /// Template initialization parameters for this step
    pub initialization: HashMap<String, Value>,
}

impl StepExecutionContext {
    pub fn task_context(&self) -> &Value {
        &self.task.context
    }

    pub fn dependency_result(&self, step_name: &str) -> Option<&Value> {
        self.dependency_results.get(step_name)
    }

    /// Result of any completed step of the task, dependency or not
    pub fn sibling_result(&self, step_name: &str) -> Option<&Value> {
        self.dependency_results
            .get(step_name)
            .or_else(|| self.sibling_results.get(step_name))
    }

    pub fn init_value(&self, key: &str) -> Option<&Value> {
        self.initialization.get(key)
    }

    /// 1-based number of the attempt in progress
    pub fn attempt_number(&self) -> i32 {
        self.step.attempts + 1
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, ctx: &StepExecutionContext) -> Result<StepHandlerResult, StepHandlerError>;
}

/// Adapter that turns an async closure into a [`StepHandler`]
pub struct FnStepHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StepHandler for FnStepHandler<F>
where
    F: Fn(StepExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepHandlerResult, StepHandlerError>> + Send,
{
    async fn call(&self, ctx: &StepExecutionContext) -> Result<StepHandlerResult, StepHandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepHandlerResult, StepHandlerError>> + Send + 'static,
{
    Arc::new(FnStepHandler { f })
}
