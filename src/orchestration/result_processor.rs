//! # Step Result Processor
//!
//! Persists the outcome of a claimed step through the step state machine:
//!
//! - `Complete(results)`: `in_progress -> complete`, results and processed
//!   timestamp written with the transition
//! - `Skipped`: `in_progress -> skipped` for skippable steps; for any other
//!   step it is a permanent failure
//! - failure: `in_progress -> error`, then, if the classifier schedules a
//!   retry and the task was not cancelled meanwhile, `error -> pending` with
//!   `backoff_until` set
//!
//! `attempts` increments on every recorded outcome. The `error` transition
//! carries the full classification metadata, including `backoff_until` when a
//! retry was intended, so a crash between the two transitions can be finished
//! later by [`StepResultProcessor::resume_interrupted_retry`].

use crate::constants::system::SKIP_NOT_ALLOWED_ERROR_CODE;
use crate::database::TaskStore;
use crate::models::{RetryConfiguration, StepUpdate, WorkflowStep};
use crate::orchestration::error_classifier::{ErrorClassifier, RetryDecision};
use crate::orchestration::errors::{transition_error, OrchestrationResult};
use crate::orchestration::step_handler::{StepHandlerError, StepHandlerResult};
use crate::orchestration::types::StepExecutionOutcome;
use crate::state_machine::{StateMachineError, StepEvent, StepStateMachine, TaskState, WorkflowStepState};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StepResultProcessor {
    store: Arc<dyn TaskStore>,
    step_state_machine: StepStateMachine,
    classifier: ErrorClassifier,
}

impl StepResultProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        step_state_machine: StepStateMachine,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            store,
            step_state_machine,
            classifier,
        }
    }

    /// Record a handler outcome for `step`, which must be the `in_progress` snapshot
    pub async fn process(
        &self,
        step: &WorkflowStep,
        retry: &RetryConfiguration,
        outcome: Result<StepHandlerResult, StepHandlerError>,
    ) -> OrchestrationResult<StepExecutionOutcome> {
        let attempts = step.attempts + 1;
        let now = Utc::now();

        match outcome {
            Ok(StepHandlerResult::Complete(results)) => {
                let update = StepUpdate::new()
                    .attempts(attempts)
                    .processed_at(now)
                    .clear_backoff();
                let transition = self
                    .step_state_machine
                    .transition(
                        step,
                        StepEvent::complete_with_results(results),
                        json!({ "attempts": attempts }),
                        update,
                    )
                    .await;
                self.settle(step, transition, StepExecutionOutcome::Completed)
            }
            Ok(StepHandlerResult::Skipped { reason }) if step.skippable => {
                let update = StepUpdate::new()
                    .attempts(attempts)
                    .processed_at(now)
                    .clear_backoff();
                let transition = self
                    .step_state_machine
                    .transition(
                        step,
                        StepEvent::Skip,
                        json!({ "reason": reason, "attempts": attempts }),
                        update,
                    )
                    .await;
                self.settle(step, transition, StepExecutionOutcome::Skipped)
            }
            Ok(StepHandlerResult::Skipped { reason }) => {
                let error = StepHandlerError::permanent(format!(
                    "Step '{}' is not skippable but its handler skipped it: {reason}",
                    step.name
                ))
                .with_error_code(SKIP_NOT_ALLOWED_ERROR_CODE);
                self.fail(step, retry, &error, attempts).await
            }
            Err(error) => self.fail(step, retry, &error, attempts).await,
        }
    }

    /// Record a failed attempt of an `in_progress` step and apply the retry policy
    pub async fn fail(
        &self,
        step: &WorkflowStep,
        retry: &RetryConfiguration,
        error: &StepHandlerError,
        attempts: i32,
    ) -> OrchestrationResult<StepExecutionOutcome> {
        let mut failure = self
            .classifier
            .classify(step, retry, error, attempts, Utc::now());

        if matches!(failure.decision, RetryDecision::Retry(_))
            && self.store.get_task_state(step.task_id).await? == TaskState::Cancelled
        {
            failure = failure.without_retry("task_cancelled");
        }

        let mut update = StepUpdate::new().attempts(attempts);
        if let Some(until) = failure.next_retry_at() {
            update = update.backoff_until(until);
        }

        let transition = self
            .step_state_machine
            .transition(
                step,
                StepEvent::fail_with_error(error.message.clone()),
                failure.metadata.clone(),
                update,
            )
            .await;
        let failed = match transition {
            Ok(failed) => failed,
            Err(e) => return self.settle(step, Err(e), StepExecutionOutcome::Superseded),
        };

        match failure.decision {
            RetryDecision::Retry(backoff) => {
                let metadata = json!({
                    "attempts": attempts,
                    "backoff_until": backoff.next_retry_at,
                });
                let retried = self
                    .step_state_machine
                    .transition(&failed, StepEvent::Retry, metadata, StepUpdate::new())
                    .await;
                info!(
                    step_id = %step.workflow_step_id,
                    step_name = %step.name,
                    attempts = attempts,
                    retry_limit = step.retry_limit,
                    next_retry_at = %backoff.next_retry_at,
                    "Step retry scheduled"
                );
                self.settle(
                    &failed,
                    retried,
                    StepExecutionOutcome::RetryScheduled {
                        next_retry_at: backoff.next_retry_at,
                    },
                )
            }
            decision => {
                let exhausted = matches!(decision, RetryDecision::Exhausted);
                warn!(
                    step_id = %step.workflow_step_id,
                    step_name = %step.name,
                    attempts = attempts,
                    classification = %failure.classification,
                    exhausted = exhausted,
                    error = %error.message,
                    "Step failed terminally"
                );
                Ok(StepExecutionOutcome::Failed {
                    classification: failure.classification,
                    exhausted,
                })
            }
        }
    }

    /// Finish an `error -> pending` retry that was recorded but not applied.
    ///
    /// Returns whether the step was moved back to `pending`.
    pub async fn resume_interrupted_retry(&self, step: &WorkflowStep) -> OrchestrationResult<bool> {
        if step.current_state != WorkflowStepState::Error || !step.has_attempts_remaining() {
            return Ok(false);
        }
        let Some(last) = self.store.last_step_transition(step.workflow_step_id).await? else {
            return Ok(false);
        };
        let intended_retry = last.to_state == WorkflowStepState::Error
            && last.metadata.get("backoff_until").is_some_and(|v| !v.is_null());
        if !intended_retry {
            return Ok(false);
        }
        if self.store.get_task_state(step.task_id).await? == TaskState::Cancelled {
            return Ok(false);
        }

        let metadata = json!({
            "attempts": step.attempts,
            "backoff_until": last.metadata["backoff_until"].clone(),
            "recovered": true,
        });
        match self
            .step_state_machine
            .transition(step, StepEvent::Retry, metadata, StepUpdate::new())
            .await
        {
            Ok(_) => {
                info!(step_id = %step.workflow_step_id, "Resumed interrupted step retry");
                Ok(true)
            }
            Err(e) if e.is_rejection() => Ok(false),
            Err(e) => Err(transition_error("step", step.workflow_step_id, e)),
        }
    }

    /// Map a transition result: a lost race becomes `Superseded`, storage errors propagate
    fn settle(
        &self,
        step: &WorkflowStep,
        transition: Result<WorkflowStep, StateMachineError>,
        success: StepExecutionOutcome,
    ) -> OrchestrationResult<StepExecutionOutcome> {
        match transition {
            Ok(updated) => {
                debug!(
                    step_id = %updated.workflow_step_id,
                    state = %updated.current_state,
                    "Step outcome recorded"
                );
                Ok(success)
            }
            Err(e) if e.is_rejection() => {
                warn!(
                    step_id = %step.workflow_step_id,
                    step_name = %step.name,
                    error = %e,
                    "Step changed while its outcome was being recorded; result discarded"
                );
                Ok(StepExecutionOutcome::Superseded)
            }
            Err(e) => Err(transition_error("step", step.workflow_step_id, e)),
        }
    }
}

/// Metadata attached when a step is resolved by an operator
pub fn manual_resolution_metadata(reason: &str) -> Value {
    json!({ "reason": reason, "resolved_at": Utc::now() })
}
