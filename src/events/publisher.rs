//! # Event Publisher
//!
//! ```rust
//! use serde_json::json;
//! use tasker_engine::events::{EventPublisher, LifecycleEvent};
//! use uuid::Uuid;
//!
//! # tokio_test::block_on(async {
//! let publisher = EventPublisher::new(16);
//! let mut events = publisher.subscribe();
//!
//! let task_id = Uuid::new_v4();
//! publisher
//!     .publish(LifecycleEvent::task("task.started", task_id, Some("pending".into()), "in_progress", json!({})))
//!     .await;
//!
//! let event = events.recv().await.unwrap();
//! assert_eq!(event.event_name, "task.started");
//! assert_eq!(event.task_id, task_id);
//! # });
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of entity a lifecycle event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    WorkflowStep,
}

/// Notification emitted on every task and step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_name: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub task_id: Uuid,
    pub from_state: Option<String>,
    pub to_state: String,
    pub metadata: Value,
    pub transitioned_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn task(
        event_name: impl Into<String>,
        task_id: Uuid,
        from_state: Option<String>,
        to_state: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            entity_type: EntityType::Task,
            entity_id: task_id,
            task_id,
            from_state,
            to_state: to_state.into(),
            metadata,
            transitioned_at: Utc::now(),
        }
    }

    pub fn step(
        event_name: impl Into<String>,
        step_id: Uuid,
        task_id: Uuid,
        from_state: Option<String>,
        to_state: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            entity_type: EntityType::WorkflowStep,
            entity_id: step_id,
            task_id,
            from_state,
            to_state: to_state.into(),
            metadata,
            transitioned_at: Utc::now(),
        }
    }
}

/// High-throughput event publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a lifecycle event, returning how many subscribers it reached.
    ///
    /// Publishing with nobody subscribed is not an error; the event is dropped.
    pub async fn publish(&self, event: LifecycleEvent) -> usize {
        tracing::trace!(
            event_name = %event.event_name,
            entity_id = %event.entity_id,
            task_id = %event.task_id,
            "Publishing lifecycle event"
        );

        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(4);
        let event = LifecycleEvent::task("task.started", Uuid::new_v4(), Some("pending".into()), "in_progress", json!({}));
        assert_eq!(publisher.publish(event).await, 0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();
        let task_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        let delivered = publisher
            .publish(LifecycleEvent::step(
                "step.completed",
                step_id,
                task_id,
                Some("in_progress".into()),
                "complete",
                json!({"attempts": 1}),
            ))
            .await;
        assert_eq!(delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_name, "step.completed");
        assert_eq!(received.entity_type, EntityType::WorkflowStep);
        assert_eq!(received.entity_id, step_id);
        assert_eq!(received.task_id, task_id);
    }
}
