//! # Data Models
//!
//! Tasks, their materialized workflow steps and dependency edges, the
//! append-only transition records, task templates, and the computed
//! readiness views the coordinator schedules from.

pub mod identity_strategy;
pub mod step_readiness;
pub mod task;
pub mod task_execution_context;
pub mod task_template;
pub mod transitions;
pub mod workflow_step;

pub use identity_strategy::{canonical_json, IdentityHasher, IdentityStrategy, StrategyIdentityHasher};
pub use step_readiness::{evaluate_step_readiness, StepReadinessStatus};
pub use task::{Task, TaskRequest};
pub use task_execution_context::{FailedStepSummary, TaskExecutionContext};
pub use task_template::{
    EnvironmentOverride, HandlerDefinition, RetryConfiguration, StepDefinition, StepOverride,
    TaskTemplate,
};
pub use transitions::{TaskTransition, WorkflowStepTransition};
pub use workflow_step::{StepUpdate, WorkflowStep, WorkflowStepEdge};
