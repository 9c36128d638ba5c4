//! # Orchestration Types
//!
//! Result types shared by the coordinator, the executor and the finalizer.

use crate::models::FailedStepSummary;
use crate::orchestration::step_handler::ErrorClassification;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Where one `execute_task` call left the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOrchestrationResult {
    Complete {
        task_id: Uuid,
        steps_executed: usize,
        duration: Duration,
    },
    /// Task is in `error`; `failed_steps` carries the triage details
    Failed {
        task_id: Uuid,
        error: String,
        failed_steps: Vec<FailedStepSummary>,
    },
    Cancelled {
        task_id: Uuid,
    },
    ResolvedManually {
        task_id: Uuid,
    },
    /// The workflow deadline passed; task state was left untouched
    TimedOut {
        task_id: Uuid,
        elapsed: Duration,
    },
}

impl TaskOrchestrationResult {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Complete { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id }
            | Self::ResolvedManually { task_id }
            | Self::TimedOut { task_id, .. } => *task_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// What happened to one step handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepExecutionOutcome {
    Completed,
    Skipped,
    /// Failed retryably; back in `pending` until `next_retry_at`
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// Terminal `error`
    Failed {
        classification: ErrorClassification,
        exhausted: bool,
    },
    /// Another claimant got the step first, or it stopped being ready
    NotClaimed,
    /// The step changed under us while the handler ran; the result was discarded
    Superseded,
    /// The store failed; the step's own outcome is unknown
    StorageError(String),
    /// The execution task itself died
    Aborted(String),
}

impl StepExecutionOutcome {
    /// Whether the handler actually ran and its outcome was recorded
    pub fn was_executed(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::RetryScheduled { .. } | Self::Failed { .. }
        )
    }
}

/// Outcome of an attempt to finalize a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationAction {
    Completed,
    Failed,
    /// Task had already been finalized by someone else
    AlreadyFinal,
    /// Task can still make progress
    NoAction,
}
