//! # Storage Layer
//!
//! The engine persists through the [`TaskStore`] trait. Every state change is
//! a compare-and-set against the entity's most recent transition: the store
//! appends the new transition, flips `most_recent`, and applies any column
//! updates in one atomic unit, or refuses with
//! [`PersistenceError::ConcurrentModification`] when the current state is not
//! the expected one. That refusal is how a lost claim race is detected.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryTaskStore`] - sharded maps, used by tests and embedded runs
//! - [`PgTaskStore`] - PostgreSQL via sqlx (feature `postgres`)

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryTaskStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskStore;

use crate::models::{
    Task, TaskTransition, WorkflowStep, WorkflowStepEdge, WorkflowStepTransition, StepUpdate,
};
use crate::state_machine::errors::PersistenceResult;
use crate::state_machine::{TaskState, WorkflowStepState};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// A task with its materialized steps and edges, ready to be written atomically
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task: Task,
    /// Steps in declaration order
    pub steps: Vec<WorkflowStep>,
    pub edges: Vec<WorkflowStepEdge>,
}

/// Outcome of [`TaskStore::create_task`]
#[derive(Debug, Clone)]
pub struct TaskCreation {
    pub task: Task,
    /// False when an existing non-terminal task with the same identity hash was returned
    pub created: bool,
}

#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Write a task, its steps, edges and their initial `pending` transitions.
    ///
    /// Deduplicates on `identity_hash` against tasks that are not in a
    /// terminal state; the check and the insert are atomic.
    async fn create_task(&self, new_task: NewTask) -> PersistenceResult<TaskCreation>;

    async fn get_task(&self, task_id: Uuid) -> PersistenceResult<Task>;

    /// Current state, from the most recent task transition
    async fn get_task_state(&self, task_id: Uuid) -> PersistenceResult<TaskState>;

    /// Steps of a task in declaration order, `current_state` populated
    async fn list_steps(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStep>>;

    async fn get_step(&self, step_id: Uuid) -> PersistenceResult<WorkflowStep>;

    async fn list_edges(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStepEdge>>;

    /// Compare-and-set task transition
    async fn transition_task(
        &self,
        task_id: Uuid,
        expected_from: TaskState,
        to: TaskState,
        metadata: Value,
    ) -> PersistenceResult<TaskTransition>;

    /// Compare-and-set step transition with column updates applied atomically
    async fn transition_step(
        &self,
        step_id: Uuid,
        expected_from: WorkflowStepState,
        to: WorkflowStepState,
        metadata: Value,
        update: StepUpdate,
    ) -> PersistenceResult<WorkflowStep>;

    /// Audit trail, ordered by sort key
    async fn task_transitions(&self, task_id: Uuid) -> PersistenceResult<Vec<TaskTransition>>;

    /// Audit trail, ordered by sort key
    async fn step_transitions(&self, step_id: Uuid) -> PersistenceResult<Vec<WorkflowStepTransition>>;

    async fn last_step_transition(
        &self,
        step_id: Uuid,
    ) -> PersistenceResult<Option<WorkflowStepTransition>> {
        Ok(self.step_transitions(step_id).await?.into_iter().last())
    }
}
