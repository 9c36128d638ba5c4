use super::{
    actions::{
        CompletionLoggingAction, ErrorStateLoggingAction, PublishTransitionEventAction,
        StateAction, TransitionContext,
    },
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    guards::{AllStepsCompleteGuard, BlockedByFailuresGuard, StateGuard, StepsStartedGuard},
    states::TaskState,
};
use crate::database::TaskStore;
use crate::events::EventPublisher;
use crate::models::{evaluate_step_readiness, Task, TaskExecutionContext};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Task lifecycle state machine over a [`TaskStore`]
#[derive(Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn TaskStore>,
    event_publisher: EventPublisher,
}

impl std::fmt::Debug for TaskStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStateMachine").finish_non_exhaustive()
    }
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn TaskStore>, event_publisher: EventPublisher) -> Self {
        Self {
            store,
            event_publisher,
        }
    }

    /// Get the current state of the task
    pub async fn current_state(&self, task_id: Uuid) -> StateMachineResult<TaskState> {
        Ok(self.store.get_task_state(task_id).await?)
    }

    /// Attempt to transition the task state.
    ///
    /// `metadata` is recorded on the transition; the event type is added to it.
    pub async fn transition(
        &self,
        task_id: Uuid,
        event: TaskEvent,
        metadata: Value,
    ) -> StateMachineResult<TaskState> {
        let current_state = self.current_state(task_id).await?;
        let target_state = determine_target_state(current_state, &event)?;

        self.check_guards(task_id, current_state, target_state).await?;

        let metadata = transition_metadata(&event, metadata);
        self.store
            .transition_task(task_id, current_state, target_state, metadata.clone())
            .await?;

        tracing::debug!(
            task_id = %task_id,
            from_state = %current_state,
            to_state = %target_state,
            event = event.event_type(),
            "Task transitioned"
        );

        let task = self.store.get_task(task_id).await?;
        self.execute_actions(&task, current_state, target_state, &event, &metadata)
            .await;

        Ok(target_state)
    }

    /// Snapshot of step readiness and counts the guards decide on
    pub async fn execution_context(&self, task_id: Uuid) -> StateMachineResult<TaskExecutionContext> {
        let status = self.store.get_task_state(task_id).await?;
        let steps = self.store.list_steps(task_id).await?;
        let edges = self.store.list_edges(task_id).await?;
        let readiness = evaluate_step_readiness(&steps, &edges, Utc::now());
        Ok(TaskExecutionContext::from_readiness(task_id, status, &readiness))
    }

    async fn check_guards(
        &self,
        task_id: Uuid,
        current_state: TaskState,
        target_state: TaskState,
    ) -> StateMachineResult<()> {
        match (current_state, target_state) {
            (TaskState::Pending, TaskState::InProgress) => {
                let ctx = self.execution_context(task_id).await?;
                StepsStartedGuard.check(&ctx)?;
            }
            (_, TaskState::Complete) => {
                let ctx = self.execution_context(task_id).await?;
                AllStepsCompleteGuard.check(&ctx)?;
            }
            (_, TaskState::Error) => {
                let ctx = self.execution_context(task_id).await?;
                BlockedByFailuresGuard.check(&ctx)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Execute actions after a persisted transition; failures are logged, never undone
    async fn execute_actions(
        &self,
        task: &Task,
        from_state: TaskState,
        to_state: TaskState,
        event: &TaskEvent,
        metadata: &Value,
    ) {
        let actions: Vec<Box<dyn StateAction<Task>>> = vec![
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
            if let Err(e) = action.execute(task, &transition).await {
                tracing::warn!(
                    task_id = %task.task_id,
                    action = action.description(),
                    error = %e,
                    "Task transition action failed"
                );
            }
        }
    }
}

/// Determine the target state based on current state and event
pub fn determine_target_state(
    current_state: TaskState,
    event: &TaskEvent,
) -> StateMachineResult<TaskState> {
    let target = match (current_state, event) {
        (TaskState::Pending, TaskEvent::Start) => TaskState::InProgress,
        (TaskState::Error, TaskEvent::Reset) => TaskState::Pending,

        (TaskState::Pending | TaskState::InProgress, TaskEvent::Complete) => TaskState::Complete,

        (TaskState::Pending | TaskState::InProgress, TaskEvent::Fail(_)) => TaskState::Error,

        (TaskState::Pending | TaskState::InProgress | TaskState::Error, TaskEvent::Cancel) => {
            TaskState::Cancelled
        }

        (TaskState::Error, TaskEvent::ResolveManually) => TaskState::ResolvedManually,

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: Some(from_state.to_string()),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}

fn transition_metadata(event: &TaskEvent, metadata: Value) -> Value {
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
