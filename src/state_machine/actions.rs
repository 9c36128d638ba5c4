use super::errors::ActionResult;
use super::states::{TaskState, WorkflowStepState};
use crate::constants::events;
use crate::events::{EventPublisher, LifecycleEvent};
use crate::models::{Task, WorkflowStep};
use async_trait::async_trait;
use serde_json::Value;

/// What an action sees of a transition that has already been persisted
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub from_state: Option<&'a str>,
    pub to_state: &'a str,
    pub event: &'a str,
    pub metadata: &'a Value,
}

/// Trait for implementing state transition actions
#[async_trait]
pub trait StateAction<T: Sync>: Send + Sync {
    /// Execute the action
    async fn execute(&self, entity: &T, transition: &TransitionContext<'_>) -> ActionResult<()>;

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Action to publish lifecycle events when state transitions occur
pub struct PublishTransitionEventAction {
    event_publisher: EventPublisher,
}

impl PublishTransitionEventAction {
    pub fn new(event_publisher: EventPublisher) -> Self {
        Self { event_publisher }
    }
}

#[async_trait]
impl StateAction<Task> for PublishTransitionEventAction {
    async fn execute(&self, task: &Task, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if let Some(event_name) = determine_task_event_name(transition.from_state, transition.to_state) {
            let event = LifecycleEvent::task(
                event_name,
                task.task_id,
                transition.from_state.map(str::to_string),
                transition.to_state,
                transition.metadata.clone(),
            );
            let delivered = self.event_publisher.publish(event).await;
            tracing::trace!(event_name, delivered, "Lifecycle event published");
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for task transition"
    }
}

#[async_trait]
impl StateAction<WorkflowStep> for PublishTransitionEventAction {
    async fn execute(&self, step: &WorkflowStep, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if let Some(event_name) = determine_step_event_name(transition.from_state, transition.to_state) {
            let event = LifecycleEvent::step(
                event_name,
                step.workflow_step_id,
                step.task_id,
                transition.from_state.map(str::to_string),
                transition.to_state,
                transition.metadata.clone(),
            );
            let delivered = self.event_publisher.publish(event).await;
            tracing::trace!(event_name, delivered, "Lifecycle event published");
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for step transition"
    }
}

/// Action to record completions in the log
pub struct CompletionLoggingAction;

#[async_trait]
impl StateAction<Task> for CompletionLoggingAction {
    async fn execute(&self, task: &Task, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if transition.to_state == TaskState::Complete.as_str() {
            tracing::info!(
                task_id = %task.task_id,
                task_name = %task.name,
                namespace = %task.namespace,
                "Task marked as complete"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log task completion"
    }
}

#[async_trait]
impl StateAction<WorkflowStep> for CompletionLoggingAction {
    async fn execute(&self, step: &WorkflowStep, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if transition.to_state == WorkflowStepState::Complete.as_str() {
            tracing::debug!(
                step_id = %step.workflow_step_id,
                task_id = %step.task_id,
                step_name = %step.name,
                attempts = step.attempts,
                "Step marked as complete with results"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log step completion"
    }
}

/// Action to surface transitions into `error` in the log
pub struct ErrorStateLoggingAction;

#[async_trait]
impl StateAction<Task> for ErrorStateLoggingAction {
    async fn execute(&self, task: &Task, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if transition.to_state == TaskState::Error.as_str() {
            tracing::error!(
                task_id = %task.task_id,
                task_name = %task.name,
                error_message = ?extract_error(transition.metadata),
                "Task transitioned to error state"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log task error state"
    }
}

#[async_trait]
impl StateAction<WorkflowStep> for ErrorStateLoggingAction {
    async fn execute(&self, step: &WorkflowStep, transition: &TransitionContext<'_>) -> ActionResult<()> {
        if transition.to_state == WorkflowStepState::Error.as_str() {
            tracing::warn!(
                step_id = %step.workflow_step_id,
                task_id = %step.task_id,
                step_name = %step.name,
                attempts = step.attempts,
                retry_limit = step.retry_limit,
                error_message = ?extract_error(transition.metadata),
                "Workflow step transitioned to error state"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log step error state"
    }
}

fn determine_task_event_name(from_state: Option<&str>, to_state: &str) -> Option<&'static str> {
    match (from_state, to_state) {
        (_, "in_progress") => Some(events::TASK_STARTED),
        (_, "complete") => Some(events::TASK_COMPLETED),
        (_, "error") => Some(events::TASK_FAILED),
        (_, "cancelled") => Some(events::TASK_CANCELLED),
        (_, "resolved_manually") => Some(events::TASK_RESOLVED_MANUALLY),
        (Some("error"), "pending") => Some(events::TASK_RESET),
        (None, "pending") => Some(events::TASK_INITIALIZED),
        _ => None,
    }
}

fn determine_step_event_name(from_state: Option<&str>, to_state: &str) -> Option<&'static str> {
    match (from_state, to_state) {
        (_, "in_progress") => Some(events::STEP_STARTED),
        (_, "complete") => Some(events::STEP_COMPLETED),
        (_, "error") => Some(events::STEP_FAILED),
        (_, "skipped") => Some(events::STEP_SKIPPED),
        (_, "cancelled") => Some(events::STEP_CANCELLED),
        (_, "resolved_manually") => Some(events::STEP_RESOLVED_MANUALLY),
        (Some("error"), "pending") => Some(events::STEP_RETRY_SCHEDULED),
        (None, "pending") => Some(events::STEP_INITIALIZED),
        _ => None,
    }
}

fn extract_error(metadata: &Value) -> Option<&str> {
    metadata.get("error").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskRequest;
    use crate::state_machine::errors::{ActionError, StateMachineError};
    use serde_json::json;

    #[test]
    fn test_event_name_determination() {
        assert_eq!(determine_task_event_name(Some("pending"), "in_progress"), Some("task.started"));
        assert_eq!(determine_task_event_name(Some("in_progress"), "complete"), Some("task.completed"));
        assert_eq!(determine_task_event_name(Some("error"), "pending"), Some("task.reset"));
        assert_eq!(determine_step_event_name(Some("in_progress"), "complete"), Some("step.completed"));
        assert_eq!(determine_step_event_name(Some("error"), "pending"), Some("step.retry_scheduled"));
        assert_eq!(determine_step_event_name(Some("pending"), "skipped"), Some("step.skipped"));
        assert_eq!(determine_step_event_name(Some("in_progress"), "pending"), None);
    }

    #[test]
    fn test_error_extraction() {
        assert_eq!(extract_error(&json!({"error": "Database connection failed"})), Some("Database connection failed"));
        assert_eq!(extract_error(&json!({"attempts": 2})), None);
    }

    #[tokio::test]
    async fn test_publish_action_emits_task_event() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        let task = Task::from_request(&TaskRequest::new("t", "ns"), "1.0.0".into(), "hash".into());

        let action = PublishTransitionEventAction::new(publisher);
        let metadata = json!({"reason": "operator"});
        let transition = TransitionContext {
            from_state: Some("in_progress"),
            to_state: "cancelled",
            event: "cancel",
            metadata: &metadata,
        };
        StateAction::<Task>::execute(&action, &task, &transition).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name, "task.cancelled");
        assert_eq!(event.entity_id, task.task_id);
        assert_eq!(event.metadata, metadata);
    }

    struct RejectingAction;

    #[async_trait]
    impl StateAction<Task> for RejectingAction {
        async fn execute(&self, _task: &Task, transition: &TransitionContext<'_>) -> ActionResult<()> {
            Err(ActionError::execution_failed(
                self.description(),
                format!("webhook refused {}", transition.to_state),
            ))
        }

        fn description(&self) -> &'static str {
            "rejecting webhook"
        }
    }

    #[tokio::test]
    async fn test_custom_action_failure_maps_to_state_machine_error() {
        let task = Task::from_request(&TaskRequest::new("t", "ns"), "1.0.0".into(), "hash".into());
        let metadata = json!({});
        let transition = TransitionContext {
            from_state: Some("pending"),
            to_state: "in_progress",
            event: "start",
            metadata: &metadata,
        };

        let err = RejectingAction.execute(&task, &transition).await.unwrap_err();
        assert_eq!(err.to_string(), "Action 'rejecting webhook' failed: webhook refused in_progress");
        let err: StateMachineError = err.into();
        assert!(matches!(err, StateMachineError::ActionFailed { .. }));
    }
}
