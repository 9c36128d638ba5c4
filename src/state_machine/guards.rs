//! Transition guards.
//!
//! Guards are pure checks over snapshots the state machine loads before a
//! transition: the task's [`TaskExecutionContext`] for task transitions, and
//! the step itself plus its [`StepReadinessStatus`] for step transitions. The
//! store's compare-and-set is what makes the transition atomic; a guard only
//! decides whether it is legal.

use super::errors::{business_rule_violation, dependencies_not_met, GuardResult};
use crate::constants::ExecutionStatus;
use crate::models::{StepReadinessStatus, TaskExecutionContext, WorkflowStep};

/// Trait for implementing state transition guards
pub trait StateGuard<T: ?Sized> {
    /// Check if a transition is allowed
    fn check(&self, subject: &T) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// A task completes only when every step satisfies its dependents
pub struct AllStepsCompleteGuard;

impl StateGuard<TaskExecutionContext> for AllStepsCompleteGuard {
    fn check(&self, ctx: &TaskExecutionContext) -> GuardResult<()> {
        if ctx.execution_status != ExecutionStatus::AllComplete {
            return Err(dependencies_not_met(format!(
                "Task {} has {} of {} steps unfinished",
                ctx.task_id,
                ctx.total_steps - ctx.completed_steps - ctx.skipped_steps - ctx.resolved_steps,
                ctx.total_steps
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "All workflow steps must be complete, skipped or resolved"
    }
}

/// A task starts once at least one of its steps has left `pending`
pub struct StepsStartedGuard;

impl StateGuard<TaskExecutionContext> for StepsStartedGuard {
    fn check(&self, ctx: &TaskExecutionContext) -> GuardResult<()> {
        if ctx.total_steps == ctx.pending_steps {
            return Err(business_rule_violation(format!(
                "Task {} has no started steps",
                ctx.task_id
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "At least one step must have started"
    }
}

/// A task fails only once no step can make further progress
pub struct BlockedByFailuresGuard;

impl StateGuard<TaskExecutionContext> for BlockedByFailuresGuard {
    fn check(&self, ctx: &TaskExecutionContext) -> GuardResult<()> {
        if ctx.execution_status != ExecutionStatus::BlockedByFailures {
            return Err(business_rule_violation(format!(
                "Task {} can still make progress ({:?})",
                ctx.task_id, ctx.execution_status
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "No step may be ready, in progress or waiting on backoff"
    }
}

/// Every dependency must be complete, skipped or resolved before a claim
pub struct StepDependenciesMetGuard;

impl StateGuard<StepReadinessStatus> for StepDependenciesMetGuard {
    fn check(&self, readiness: &StepReadinessStatus) -> GuardResult<()> {
        if !readiness.dependencies_satisfied {
            return Err(dependencies_not_met(format!(
                "Step {} has {} of {} dependencies satisfied",
                readiness.workflow_step_id, readiness.completed_parents, readiness.total_parents
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "All step dependencies must be satisfied"
    }
}

/// A stored backoff deadline must have elapsed before a claim
pub struct StepBackoffElapsedGuard;

impl StateGuard<StepReadinessStatus> for StepBackoffElapsedGuard {
    fn check(&self, readiness: &StepReadinessStatus) -> GuardResult<()> {
        if readiness.in_backoff {
            return Err(business_rule_violation(format!(
                "Step {} is in backoff until {:?}",
                readiness.workflow_step_id, readiness.next_retry_at
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Step backoff must have elapsed"
    }
}

/// A failed step returns to `pending` only while it is retryable and has attempts left
pub struct StepCanBeRetriedGuard;

impl StateGuard<WorkflowStep> for StepCanBeRetriedGuard {
    fn check(&self, step: &WorkflowStep) -> GuardResult<()> {
        if !step.retryable {
            return Err(business_rule_violation(format!(
                "Step {} is not retryable",
                step.workflow_step_id
            )));
        }
        if !step.has_attempts_remaining() {
            return Err(business_rule_violation(format!(
                "Step {} exhausted its retry budget ({} of {} attempts)",
                step.workflow_step_id, step.attempts, step.retry_limit
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Step must be retryable with attempts remaining"
    }
}

/// Only steps declared skippable may be skipped
pub struct StepSkippableGuard;

impl StateGuard<WorkflowStep> for StepSkippableGuard {
    fn check(&self, step: &WorkflowStep) -> GuardResult<()> {
        if !step.skippable {
            return Err(business_rule_violation(format!(
                "Step {} ({}) is not skippable",
                step.workflow_step_id, step.name
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Step must be declared skippable"
    }
}
