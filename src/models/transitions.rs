//! Append-only transition records for tasks and steps.
//!
//! Exactly one record per entity carries `most_recent = true`; its `to_state`
//! is the entity's current state. `sort_key` increases by one per transition
//! of the same entity, starting at 0 for the initial `pending` record.

use crate::state_machine::{TaskState, WorkflowStepState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: Uuid,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub sort_key: i32,
    pub most_recent: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepTransition {
    pub workflow_step_id: Uuid,
    pub task_id: Uuid,
    pub from_state: Option<WorkflowStepState>,
    pub to_state: WorkflowStepState,
    pub sort_key: i32,
    pub most_recent: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl TaskTransition {
    /// The record written when a task is created
    pub fn initial(task_id: Uuid, metadata: Value) -> Self {
        Self {
            task_id,
            from_state: None,
            to_state: TaskState::Pending,
            sort_key: 0,
            most_recent: true,
            metadata,
            created_at: Utc::now(),
        }
    }
}

impl WorkflowStepTransition {
    /// The record written when a step is materialized
    pub fn initial(workflow_step_id: Uuid, task_id: Uuid, metadata: Value) -> Self {
        Self {
            workflow_step_id,
            task_id,
            from_state: None,
            to_state: WorkflowStepState::Pending,
            sort_key: 0,
            most_recent: true,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Read a string field from the transition metadata
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}
