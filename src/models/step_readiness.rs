//! # Step Readiness Status
//!
//! Computed, never stored: readiness analysis for every step of a task,
//! evaluated from the steps' current states and the task's dependency edges.
//!
//! A step is ready for execution when it is `pending`, every dependency is in
//! a dependency-satisfying state (`complete`, `skipped`, `resolved_manually`),
//! and its backoff deadline, if any, has elapsed. A pending step is *blocked*
//! when some ancestor rests in `error` or `cancelled`: it can never become
//! ready without operator intervention.

use crate::models::workflow_step::{WorkflowStep, WorkflowStepEdge};
use crate::state_machine::WorkflowStepState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReadinessStatus {
    pub workflow_step_id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub position: i32,
    pub current_state: WorkflowStepState,
    pub dependencies_satisfied: bool,
    pub total_parents: usize,
    pub completed_parents: usize,
    /// Pending with a failed or cancelled ancestor
    pub blocked_by_failure: bool,
    pub in_backoff: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub ready_for_execution: bool,
    pub attempts: i32,
    pub retry_limit: i32,
}

impl StepReadinessStatus {
    /// Pending, not ready yet, but able to become ready without intervention
    pub fn is_waiting(&self) -> bool {
        self.current_state == WorkflowStepState::Pending
            && !self.ready_for_execution
            && !self.blocked_by_failure
    }
}

/// Evaluate readiness for every step of one task, ordered by declaration position
pub fn evaluate_step_readiness(
    steps: &[WorkflowStep],
    edges: &[WorkflowStepEdge],
    now: DateTime<Utc>,
) -> Vec<StepReadinessStatus> {
    let index: HashMap<Uuid, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.workflow_step_id, i))
        .collect();

    let mut parents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for edge in edges {
        if let (Some(&from), Some(&to)) = (index.get(&edge.from_step_id), index.get(&edge.to_step_id)) {
            parents[to].push(from);
        }
    }

    let mut blocked_memo: Vec<Option<bool>> = vec![None; steps.len()];
    let mut visiting = vec![false; steps.len()];

    let mut statuses: Vec<StepReadinessStatus> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let total_parents = parents[i].len();
            let completed_parents = parents[i]
                .iter()
                .filter(|&&p| steps[p].current_state.satisfies_dependencies())
                .count();
            let dependencies_satisfied = completed_parents == total_parents;
            let is_pending = step.current_state == WorkflowStepState::Pending;
            let blocked_by_failure = is_pending
                && has_blocking_ancestor(i, steps, &parents, &mut blocked_memo, &mut visiting);
            let in_backoff = is_pending && step.in_backoff(now);

            StepReadinessStatus {
                workflow_step_id: step.workflow_step_id,
                task_id: step.task_id,
                name: step.name.clone(),
                position: step.position,
                current_state: step.current_state,
                dependencies_satisfied,
                total_parents,
                completed_parents,
                blocked_by_failure,
                in_backoff,
                next_retry_at: if in_backoff { step.backoff_until } else { None },
                ready_for_execution: is_pending && dependencies_satisfied && !in_backoff,
                attempts: step.attempts,
                retry_limit: step.retry_limit,
            }
        })
        .collect();

    statuses.sort_by_key(|s| s.position);
    statuses
}

fn has_blocking_ancestor(
    node: usize,
    steps: &[WorkflowStep],
    parents: &[Vec<usize>],
    memo: &mut [Option<bool>],
    visiting: &mut [bool],
) -> bool {
    if let Some(known) = memo[node] {
        return known;
    }
    if visiting[node] {
        return false;
    }
    visiting[node] = true;

    let mut blocked = false;
    for &parent in &parents[node] {
        let parent_state = steps[parent].current_state;
        if parent_state.blocks_dependents()
            || (parent_state == WorkflowStepState::Pending
                && has_blocking_ancestor(parent, steps, parents, memo, visiting))
        {
            blocked = true;
            break;
        }
    }

    visiting[node] = false;
    memo[node] = Some(blocked);
    blocked
}
