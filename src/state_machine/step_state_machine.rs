use super::{
    actions::{
        CompletionLoggingAction, ErrorStateLoggingAction, PublishTransitionEventAction,
        StateAction, TransitionContext,
    },
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    guards::{
        StateGuard, StepBackoffElapsedGuard, StepCanBeRetriedGuard, StepDependenciesMetGuard,
        StepSkippableGuard,
    },
    states::WorkflowStepState,
};
use crate::database::TaskStore;
use crate::events::EventPublisher;
use crate::models::{evaluate_step_readiness, StepUpdate, WorkflowStep};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

/// Workflow step state machine over a [`TaskStore`].
///
/// The step passed to [`transition`](Self::transition) is a snapshot; its
/// `current_state` is the expected state of the store's compare-and-set, so a
/// stale snapshot surfaces as a concurrent modification rather than a
/// duplicate transition.
#[derive(Clone)]
pub struct StepStateMachine {
    store: Arc<dyn TaskStore>,
    event_publisher: EventPublisher,
}

impl std::fmt::Debug for StepStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepStateMachine").finish_non_exhaustive()
    }
}

impl StepStateMachine {
    pub fn new(store: Arc<dyn TaskStore>, event_publisher: EventPublisher) -> Self {
        Self {
            store,
            event_publisher,
        }
    }

    /// Attempt to transition the step, applying `update` atomically with it
    pub async fn transition(
        &self,
        step: &WorkflowStep,
        event: StepEvent,
        metadata: Value,
        mut update: StepUpdate,
    ) -> StateMachineResult<WorkflowStep> {
        let current_state = step.current_state;
        let target_state = determine_target_state(current_state, &event)?;

        self.check_guards(step, current_state, target_state).await?;

        if let (Some(results), None) = (event.results(), &update.results) {
            update.results = Some(results.clone());
        }

        let metadata = transition_metadata(&event, metadata);
        let updated = self
            .store
            .transition_step(
                step.workflow_step_id,
                current_state,
                target_state,
                metadata.clone(),
                update,
            )
            .await?;

        tracing::debug!(
            step_id = %updated.workflow_step_id,
            task_id = %updated.task_id,
            step_name = %updated.name,
            from_state = %current_state,
            to_state = %target_state,
            event = event.event_type(),
            "Step transitioned"
        );

        self.execute_actions(&updated, current_state, target_state, &event, &metadata)
            .await;

        Ok(updated)
    }

    async fn check_guards(
        &self,
        step: &WorkflowStep,
        current_state: WorkflowStepState,
        target_state: WorkflowStepState,
    ) -> StateMachineResult<()> {
        match (current_state, target_state) {
            (WorkflowStepState::Pending, WorkflowStepState::InProgress) => {
                let steps = self.store.list_steps(step.task_id).await?;
                let edges = self.store.list_edges(step.task_id).await?;
                let readiness = evaluate_step_readiness(&steps, &edges, Utc::now());
                let status = readiness
                    .iter()
                    .find(|r| r.workflow_step_id == step.workflow_step_id)
                    .ok_or_else(|| {
                        StateMachineError::Internal(format!(
                            "Step {} is not part of task {}",
                            step.workflow_step_id, step.task_id
                        ))
                    })?;
                StepDependenciesMetGuard.check(status)?;
                StepBackoffElapsedGuard.check(status)?;
            }
            (WorkflowStepState::Error, WorkflowStepState::Pending) => {
                StepCanBeRetriedGuard.check(step)?;
            }
            (_, WorkflowStepState::Skipped) => {
                StepSkippableGuard.check(step)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Execute actions after a persisted transition; failures are logged, never undone
    async fn execute_actions(
        &self,
        step: &WorkflowStep,
        from_state: WorkflowStepState,
        to_state: WorkflowStepState,
        event: &StepEvent,
        metadata: &Value,
    ) {
        let actions: Vec<Box<dyn StateAction<WorkflowStep>>> = vec![
            Box::new(PublishTransitionEventAction::new(self.event_publisher.clone())),
            Box::new(CompletionLoggingAction),
            Box::new(ErrorStateLoggingAction),
        ];

        let transition = TransitionContext {
            from_state: Some(from_state.as_str()),
            to_state: to_state.as_str(),
            event: event.event_type(),
            metadata,
        };

        for action in actions {
            if let Err(e) = action.execute(step, &transition).await {
                tracing::warn!(
                    step_id = %step.workflow_step_id,
                    action = action.description(),
                    error = %e,
                    "Step transition action failed"
                );
            }
        }
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(
    current_state: WorkflowStepState,
    event: &StepEvent,
) -> StateMachineResult<WorkflowStepState> {
    let target = match (current_state, event) {
        (WorkflowStepState::Pending, StepEvent::Start) => WorkflowStepState::InProgress,

        (WorkflowStepState::InProgress, StepEvent::Complete(_)) => WorkflowStepState::Complete,

        (WorkflowStepState::InProgress, StepEvent::Fail(_)) => WorkflowStepState::Error,

        (WorkflowStepState::Pending | WorkflowStepState::InProgress, StepEvent::Skip) => {
            WorkflowStepState::Skipped
        }

        (WorkflowStepState::Error, StepEvent::Retry) => WorkflowStepState::Pending,

        (
            WorkflowStepState::Pending | WorkflowStepState::InProgress | WorkflowStepState::Error,
            StepEvent::Cancel,
        ) => WorkflowStepState::Cancelled,

        (WorkflowStepState::Error, StepEvent::ResolveManually) => {
            WorkflowStepState::ResolvedManually
        }

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: Some(from_state.to_string()),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}

fn transition_metadata(event: &StepEvent, metadata: Value) -> Value {
    let mut metadata = match metadata {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("details".to_string(), other);
            map
        }
    };
    metadata.insert("event".to_string(), json!(event.event_type()));
    if let Some(error) = event.error_message() {
        metadata
            .entry("error".to_string())
            .or_insert_with(|| json!(error));
    }
    Value::Object(metadata)
}
