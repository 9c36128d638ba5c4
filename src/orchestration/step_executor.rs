//! # Step Executor
//!
//! Bounded-concurrency execution of ready steps.
//!
//! One [`StepExecutor`] owns a semaphore whose permit count is
//! `execution.max_concurrent_steps`. Every step of a batch is spawned as its
//! own tokio task, but it does nothing until it holds a permit, so at most
//! that many steps are claimed and running at once across every task sharing
//! the executor. Excess steps queue on the semaphore.
//!
//! Per step:
//!
//! 1. acquire a permit
//! 2. claim the step through the [`StepLifecycle`] (`pending -> in_progress`);
//!    losing the claim is a no-op
//! 3. run the handler under the step timeout, catching panics
//! 4. record the outcome through the lifecycle
//! 5. release the permit (on every exit path, by drop)
//!
//! A failure in one step never affects collection of the others, and every
//! input step gets exactly one `(step_id, outcome)` pair back.

use crate::constants::system::{HANDLER_PANIC_ERROR_CODE, STEP_TIMEOUT_ERROR_CODE};
use crate::models::WorkflowStep;
use crate::orchestration::errors::OrchestrationResult;
use crate::orchestration::step_handler::{
    StepExecutionContext, StepHandler, StepHandlerError, StepHandlerResult,
};
use crate::orchestration::types::StepExecutionOutcome;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// A step that has been claimed and is ready to run
pub struct ClaimedStep {
    /// Snapshot of the step after the claim (`in_progress`)
    pub context: StepExecutionContext,
    pub handler: Arc<dyn StepHandler>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ClaimedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedStep")
            .field("step_id", &self.context.step.workflow_step_id)
            .field("step_name", &self.context.step.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// The state side of step execution: claiming and recording outcomes
#[async_trait]
pub trait StepLifecycle: Send + Sync {
    /// Atomically claim the step. `Ok(None)` means someone else has it or it is
    /// no longer ready.
    async fn claim(&self, step: &WorkflowStep) -> OrchestrationResult<Option<ClaimedStep>>;

    /// Persist the handler outcome of a claimed step
    async fn record(
        &self,
        claimed: ClaimedStep,
        outcome: Result<StepHandlerResult, StepHandlerError>,
    ) -> OrchestrationResult<StepExecutionOutcome>;
}

/// Semaphore-bounded step runner, shared by all coordinators in a process
#[derive(Debug, Clone)]
pub struct StepExecutor {
    semaphore: Arc<Semaphore>,
    max_concurrent_steps: usize,
}

impl StepExecutor {
    pub fn new(max_concurrent_steps: usize) -> Self {
        let max_concurrent_steps = max_concurrent_steps.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_steps)),
            max_concurrent_steps,
        }
    }

    pub fn max_concurrent_steps(&self) -> usize {
        self.max_concurrent_steps
    }

    /// Steps currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_steps - self.semaphore.available_permits()
    }

    /// Execute a batch of ready steps, returning one outcome per input in input order
    #[instrument(skip(self, lifecycle, steps), fields(step_count = steps.len()))]
    pub async fn execute_batch(
        &self,
        lifecycle: Arc<dyn StepLifecycle>,
        steps: Vec<WorkflowStep>,
    ) -> Vec<(Uuid, StepExecutionOutcome)> {
        if steps.is_empty() {
            return Vec::new();
        }

        debug!(
            step_count = steps.len(),
            max_concurrent_steps = self.max_concurrent_steps,
            "Dispatching step batch"
        );

        let mut step_ids = Vec::with_capacity(steps.len());
        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            step_ids.push(step.workflow_step_id);
            let semaphore = Arc::clone(&self.semaphore);
            let lifecycle = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move {
                Self::execute_step(semaphore, lifecycle, step).await
            }));
        }

        let joined = futures::future::join_all(handles).await;

        step_ids
            .into_iter()
            .zip(joined)
            .map(|(step_id, joined)| {
                let outcome = joined.unwrap_or_else(|e| {
                    error!(step_id = %step_id, error = %e, "Step execution task failed");
                    StepExecutionOutcome::Aborted(e.to_string())
                });
                (step_id, outcome)
            })
            .collect()
    }

    async fn execute_step(
        semaphore: Arc<Semaphore>,
        lifecycle: Arc<dyn StepLifecycle>,
        step: WorkflowStep,
    ) -> StepExecutionOutcome {
        let step_id = step.workflow_step_id;

        // Phase 1: resource acquisition; the permit is released on drop
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return StepExecutionOutcome::Aborted(e.to_string()),
        };

        // Phase 2: claim
        let claimed = match lifecycle.claim(&step).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(step_id = %step_id, step_name = %step.name, "Step not claimed");
                return StepExecutionOutcome::NotClaimed;
            }
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "Failed to claim step");
                return StepExecutionOutcome::StorageError(e.to_string());
            }
        };

        // Phase 3: handler
        let started = Instant::now();
        let result = Self::run_handler(&claimed).await;
        debug!(
            step_id = %step_id,
            step_name = %step.name,
            success = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Step handler finished"
        );

        // Phase 4: record
        match lifecycle.record(claimed, result).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(step_id = %step_id, error = %e, "Failed to record step outcome");
                StepExecutionOutcome::StorageError(e.to_string())
            }
        }
    }

    /// Run the handler, turning a timeout or a panic into a retryable failure
    async fn run_handler(claimed: &ClaimedStep) -> Result<StepHandlerResult, StepHandlerError> {
        let call = AssertUnwindSafe(claimed.handler.call(&claimed.context)).catch_unwind();

        match tokio::time::timeout(claimed.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(StepHandlerError::retryable(format!("Step handler panicked: {message}"))
                    .with_error_code(HANDLER_PANIC_ERROR_CODE))
            }
            Err(_) => Err(StepHandlerError::retryable(format!(
                "Step exceeded execution timeout of {}ms",
                claimed.timeout.as_millis()
            ))
            .with_error_code(STEP_TIMEOUT_ERROR_CODE)),
        }
    }
}
