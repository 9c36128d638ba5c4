//! # Workflow Step Model
//!
//! One node of a task's realized DAG and the unit of retryable work. All steps
//! of a task are materialized together at task creation from the template and
//! are never deleted. A step is mutated only by the coordinator (claim) and by
//! the handler outcome (results, attempts, backoff).
//!
//! `current_state` mirrors the step's most recent transition. Stores populate
//! it on read; it is never written independently of a transition.

use crate::state_machine::WorkflowStepState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub workflow_step_id: Uuid,
    pub task_id: Uuid,
    /// Step definition name, unique within the task
    pub name: String,
    /// Declaration index in the template; deterministic tie-break for ordering
    pub position: i32,
    pub current_state: WorkflowStepState,
    pub retryable: bool,
    /// Total attempts allowed, including the first
    pub retry_limit: i32,
    pub skippable: bool,
    pub attempts: i32,
    /// Dependency results, materialized when the step is claimed
    pub inputs: Option<Value>,
    /// Handler output, written only from a handler outcome
    pub results: Option<Value>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be dispatched
    pub backoff_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    /// A fresh `pending` step for a task
    pub fn new(
        task_id: Uuid,
        name: impl Into<String>,
        position: i32,
        retryable: bool,
        retry_limit: i32,
        skippable: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_step_id: Uuid::new_v4(),
            task_id,
            name: name.into(),
            position,
            current_state: WorkflowStepState::Pending,
            retryable,
            retry_limit,
            skippable,
            attempts: 0,
            inputs: None,
            results: None,
            processed: false,
            processed_at: None,
            last_attempted_at: None,
            backoff_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a stored backoff deadline still blocks dispatch at `now`
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    /// Whether another attempt fits within the retry budget
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.retry_limit
    }

    /// Apply a partial update, as a store does when persisting a transition
    pub fn apply_update(&mut self, update: &StepUpdate) {
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(inputs) = &update.inputs {
            self.inputs = Some(inputs.clone());
        }
        if let Some(results) = &update.results {
            self.results = Some(results.clone());
        }
        if let Some(processed) = update.processed {
            self.processed = processed;
        }
        if let Some(processed_at) = update.processed_at {
            self.processed_at = Some(processed_at);
        }
        if let Some(last_attempted_at) = update.last_attempted_at {
            self.last_attempted_at = Some(last_attempted_at);
        }
        if let Some(backoff_until) = update.backoff_until {
            self.backoff_until = backoff_until;
        }
        self.updated_at = Utc::now();
    }
}

/// Column updates written atomically with a step transition.
///
/// `None` leaves a column untouched. `backoff_until` is doubly optional so a
/// transition can clear a stored deadline (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub attempts: Option<i32>,
    pub inputs: Option<Value>,
    pub results: Option<Value>,
    pub processed: Option<bool>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub backoff_until: Option<Option<DateTime<Utc>>>,
}

impl StepUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn results(mut self, results: Value) -> Self {
        self.results = Some(results);
        self
    }

    /// Mark the step processed at `at`
    pub fn processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed = Some(true);
        self.processed_at = Some(at);
        self
    }

    pub fn last_attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempted_at = Some(at);
        self
    }

    pub fn backoff_until(mut self, until: DateTime<Utc>) -> Self {
        self.backoff_until = Some(Some(until));
        self
    }

    pub fn clear_backoff(mut self) -> Self {
        self.backoff_until = Some(None);
        self
    }
}

/// Dependency edge between two steps of the same task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowStepEdge {
    pub task_id: Uuid,
    /// The dependency
    pub from_step_id: Uuid,
    /// The dependent
    pub to_step_id: Uuid,
    pub name: String,
}
