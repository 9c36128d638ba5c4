//! # Orchestration Engine
//!
//! Decides what runs next, when, how many times, and when a task is finished.
//!
//! ## Core Components
//!
//! - **DependencyGraphAnalyzer**: validates a template's step DAG and computes
//!   topological order, levels, roots and leaves
//! - **TaskInitializer**: materializes a task's steps and edges from its template
//! - **ViableStepDiscovery**: evaluates step readiness over a store snapshot
//! - **StepExecutor**: semaphore-bounded parallel step execution
//! - **StepResultProcessor**: persists handler outcomes and applies the retry policy
//! - **ErrorClassifier** / **BackoffCalculator**: retry decisions and backoff deadlines
//! - **TaskFinalizer**: moves a task to `complete` or `error` once it cannot progress
//! - **WorkflowCoordinator**: the control loop tying the above together
//!
//! ## Data flow
//!
//! ```text
//! TaskRequest -> TaskInitializer -> TaskStore
//!                                      |
//!         +--------- snapshot ---------+
//!         v
//! ViableStepDiscovery -> StepExecutor -> StepHandler (user code)
//!         ^                                  |
//!         +-- StepResultProcessor <----------+
//!                     |
//!                TaskFinalizer
//! ```

pub mod backoff_calculator;
pub mod dependency_graph;
pub mod error_classifier;
pub mod errors;
pub mod result_processor;
pub mod step_executor;
pub mod step_handler;
pub mod task_finalizer;
pub mod task_initializer;
pub mod types;
pub mod viable_step_discovery;
pub mod workflow_coordinator;

// Re-export core types and components for easy access
pub use backoff_calculator::{
    BackoffCalculator, BackoffCalculatorConfig, BackoffContext, BackoffResult, BackoffType,
};
pub use dependency_graph::{DependencyAnalysis, DependencyGraphAnalyzer, GraphValidationError};
pub use error_classifier::{ErrorClassifier, FailureClassification, RetryDecision};
pub use errors::{OrchestrationError, OrchestrationResult};
pub use result_processor::StepResultProcessor;
pub use step_executor::{ClaimedStep, StepExecutor, StepLifecycle};
pub use step_handler::{
    handler_fn, ErrorClassification, FnStepHandler, StepExecutionContext, StepHandler,
    StepHandlerError, StepHandlerResult,
};
pub use task_finalizer::{FinalizationResult, TaskFinalizer};
pub use task_initializer::{TaskInitializationResult, TaskInitializer};
pub use types::{FinalizationAction, StepExecutionOutcome, TaskOrchestrationResult};
pub use viable_step_discovery::{TaskSnapshot, ViableStepDiscovery};
pub use workflow_coordinator::{WorkflowCoordinator, WorkflowCoordinatorConfig};
