#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Engine
//!
//! A durable DAG workflow orchestrator. Given a registered template of named
//! steps and their dependencies, the engine drives each task instance to a
//! terminal state, persisting every state change so a run can be resumed
//! after a crash, retried, or inspected mid-flight.
//!
//! ## Architecture
//!
//! ```text
//! Registry (templates + handlers, validated once)
//!     -> DependencyGraphAnalyzer (build time)
//!     -> WorkflowCoordinator (per task)
//!         -> StepExecutor (bounded parallel dispatch)
//!             -> StepHandler (user code)
//!         -> State machines (compare-and-set through the TaskStore)
//! ```
//!
//! Every task and step state is the most recent row of an append-only
//! transition log. Claims (`pending -> in_progress`) are atomic and
//! conflict-detecting, so two coordinators can never run the same step at the
//! same time; the loser of a race simply moves on.
//!
//! ## Module Organization
//!
//! - [`models`] - tasks, steps, edges, transitions, templates, readiness views
//! - [`database`] - the [`TaskStore`](database::TaskStore) trait, in-memory and PostgreSQL backends
//! - [`state_machine`] - task and step state machines with guards and actions
//! - [`orchestration`] - graph analysis, retry policy, executor and coordinator
//! - [`registry`] - template and handler registration
//! - [`config`] - layered configuration
//! - [`events`] - lifecycle event broadcast
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use std::sync::Arc;
//! use tasker_engine::config::TaskerConfig;
//! use tasker_engine::database::InMemoryTaskStore;
//! use tasker_engine::models::TaskRequest;
//! use tasker_engine::orchestration::{handler_fn, StepHandlerResult, WorkflowCoordinator};
//! use tasker_engine::registry::TaskHandlerRegistryBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaskerConfig::default();
//! let registry = TaskHandlerRegistryBuilder::from_config(&config)
//!     .register_handler(
//!         "greet",
//!         handler_fn(|ctx| async move {
//!             Ok(StepHandlerResult::Complete(json!({ "hello": ctx.task_context()["name"] })))
//!         }),
//!     )
//!     .register_template_file("config/task_templates/greeting.yaml")?
//!     .build()?;
//!
//! let coordinator = WorkflowCoordinator::new(Arc::new(InMemoryTaskStore::new()), registry, &config);
//! let result = coordinator
//!     .submit_and_execute(
//!         TaskRequest::new("greeting", "examples").with_context(json!({ "name": "world" })),
//!     )
//!     .await?;
//! assert!(result.is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # unit and in-memory integration tests
//! cargo test --features postgres-tests        # PostgreSQL store tests (needs DATABASE_URL)
//! cargo bench --features benchmarks           # criterion benchmarks
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::{
    BackoffConfig, ConfigManager, DatabaseConfig, EngineConfig, EventsConfig, ExecutionConfig,
    OrchestrationConfig, TaskerConfig,
};
pub use constants::{
    status_groups, system, ExecutionStatus, RecommendedAction, TaskStatus, WorkflowStepStatus,
};
// Re-export constants events with different name to avoid conflict
pub use constants::events as system_events;
pub use database::{InMemoryTaskStore, TaskStore};
#[cfg(feature = "postgres")]
pub use database::PgTaskStore;
pub use error::{Result, TaskerError};
pub use models::{StepReadinessStatus, Task, TaskExecutionContext, TaskRequest, TaskTemplate};
pub use orchestration::{
    StepHandler, StepHandlerError, StepHandlerResult, TaskOrchestrationResult, WorkflowCoordinator,
};
pub use registry::{TaskHandlerRegistry, TaskHandlerRegistryBuilder};
