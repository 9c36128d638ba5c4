//! In-memory [`TaskStore`].
//!
//! Each task lives in one `DashMap` entry together with its steps, edges and
//! transition logs, so a step or task compare-and-set is serialized by the
//! entry's shard lock. The identity index is a separate mutex; it is always
//! taken before any task entry, never while one is held.

use super::{NewTask, TaskCreation, TaskStore};
use crate::models::{
    StepUpdate, Task, TaskTransition, WorkflowStep, WorkflowStepEdge, WorkflowStepTransition,
};
use crate::constants::status_groups::TASK_ACTIVE_STATES;
use crate::state_machine::errors::{PersistenceError, PersistenceResult};
use crate::state_machine::{TaskState, WorkflowStepState};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug)]
struct TaskRecord {
    task: Task,
    state: TaskState,
    transitions: Vec<TaskTransition>,
    steps: Vec<WorkflowStep>,
    step_transitions: HashMap<Uuid, Vec<WorkflowStepTransition>>,
    edges: Vec<WorkflowStepEdge>,
}

impl TaskRecord {
    fn step_mut(&mut self, step_id: Uuid) -> PersistenceResult<&mut WorkflowStep> {
        self.steps
            .iter_mut()
            .find(|s| s.workflow_step_id == step_id)
            .ok_or_else(|| PersistenceError::step_not_found(step_id))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<Uuid, TaskRecord>,
    step_index: DashMap<Uuid, Uuid>,
    identity_index: Mutex<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn task_id_for_step(&self, step_id: Uuid) -> PersistenceResult<Uuid> {
        self.step_index
            .get(&step_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| PersistenceError::step_not_found(step_id))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, new_task: NewTask) -> PersistenceResult<TaskCreation> {
        let NewTask { task, mut steps, edges } = new_task;
        let mut identity_index = self.identity_index.lock();

        if let Some(candidates) = identity_index.get(&task.identity_hash) {
            for candidate in candidates {
                if let Some(record) = self.tasks.get(candidate) {
                    if TASK_ACTIVE_STATES.contains(&record.state) {
                        return Ok(TaskCreation {
                            task: record.task.clone(),
                            created: false,
                        });
                    }
                }
            }
        }

        let task_id = task.task_id;
        let mut step_transitions = HashMap::with_capacity(steps.len());
        for step in steps.iter_mut() {
            step.current_state = WorkflowStepState::Pending;
            step_transitions.insert(
                step.workflow_step_id,
                vec![WorkflowStepTransition::initial(
                    step.workflow_step_id,
                    task_id,
                    json!({"event": "initialize"}),
                )],
            );
            self.step_index.insert(step.workflow_step_id, task_id);
        }

        let record = TaskRecord {
            task: task.clone(),
            state: TaskState::Pending,
            transitions: vec![TaskTransition::initial(task_id, json!({"event": "initialize"}))],
            steps,
            step_transitions,
            edges,
        };
        self.tasks.insert(task_id, record);
        identity_index
            .entry(task.identity_hash.clone())
            .or_default()
            .push(task_id);

        Ok(TaskCreation { task, created: true })
    }

    async fn get_task(&self, task_id: Uuid) -> PersistenceResult<Task> {
        self.tasks
            .get(&task_id)
            .map(|record| record.task.clone())
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn get_task_state(&self, task_id: Uuid) -> PersistenceResult<TaskState> {
        self.tasks
            .get(&task_id)
            .map(|record| record.state)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn list_steps(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStep>> {
        self.tasks
            .get(&task_id)
            .map(|record| record.steps.clone())
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn get_step(&self, step_id: Uuid) -> PersistenceResult<WorkflowStep> {
        let task_id = self.task_id_for_step(step_id)?;
        let record = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))?;
        record
            .steps
            .iter()
            .find(|s| s.workflow_step_id == step_id)
            .cloned()
            .ok_or_else(|| PersistenceError::step_not_found(step_id))
    }

    async fn list_edges(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStepEdge>> {
        self.tasks
            .get(&task_id)
            .map(|record| record.edges.clone())
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected_from: TaskState,
        to: TaskState,
        metadata: Value,
    ) -> PersistenceResult<TaskTransition> {
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))?;

        if record.state != expected_from {
            return Err(PersistenceError::concurrent_modification(
                task_id,
                expected_from,
                record.state,
            ));
        }

        let sort_key = record.transitions.last().map_or(0, |t| t.sort_key + 1);
        for previous in record.transitions.iter_mut() {
            previous.most_recent = false;
        }
        let transition = TaskTransition {
            task_id,
            from_state: Some(expected_from),
            to_state: to,
            sort_key,
            most_recent: true,
            metadata,
            created_at: Utc::now(),
        };
        record.transitions.push(transition.clone());
        record.state = to;
        record.task.updated_at = transition.created_at;
        Ok(transition)
    }

    async fn transition_step(
        &self,
        step_id: Uuid,
        expected_from: WorkflowStepState,
        to: WorkflowStepState,
        metadata: Value,
        update: StepUpdate,
    ) -> PersistenceResult<WorkflowStep> {
        let task_id = self.task_id_for_step(step_id)?;
        let mut record = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))?;

        let step = record.step_mut(step_id)?;
        if step.current_state != expected_from {
            return Err(PersistenceError::concurrent_modification(
                step_id,
                expected_from,
                step.current_state,
            ));
        }
        step.current_state = to;
        step.apply_update(&update);
        let updated = step.clone();

        let log = record.step_transitions.entry(step_id).or_default();
        let sort_key = log.last().map_or(0, |t| t.sort_key + 1);
        for previous in log.iter_mut() {
            previous.most_recent = false;
        }
        log.push(WorkflowStepTransition {
            workflow_step_id: step_id,
            task_id,
            from_state: Some(expected_from),
            to_state: to,
            sort_key,
            most_recent: true,
            metadata,
            created_at: Utc::now(),
        });

        Ok(updated)
    }

    async fn task_transitions(&self, task_id: Uuid) -> PersistenceResult<Vec<TaskTransition>> {
        self.tasks
            .get(&task_id)
            .map(|record| record.transitions.clone())
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn step_transitions(&self, step_id: Uuid) -> PersistenceResult<Vec<WorkflowStepTransition>> {
        let task_id = self.task_id_for_step(step_id)?;
        let record = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))?;
        Ok(record
            .step_transitions
            .get(&step_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskRequest;
    use std::sync::Arc;

    fn new_task(hash: &str, step_names: &[&str]) -> NewTask {
        let task = Task::from_request(&TaskRequest::new("t", "ns"), "1.0.0".into(), hash.into());
        let steps = step_names
            .iter()
            .enumerate()
            .map(|(i, name)| WorkflowStep::new(task.task_id, *name, i as i32, true, 3, false))
            .collect();
        NewTask { task, steps, edges: Vec::new() }
    }

    #[tokio::test]
    async fn test_create_writes_initial_transitions() {
        let store = InMemoryTaskStore::new();
        let creation = store.create_task(new_task("h1", &["a", "b"])).await.unwrap();
        assert!(creation.created);

        let task_id = creation.task.task_id;
        assert_eq!(store.get_task_state(task_id).await.unwrap(), TaskState::Pending);

        let transitions = store.task_transitions(task_id).await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].sort_key, 0);
        assert!(transitions[0].most_recent);

        let steps = store.list_steps(task_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        let step_log = store.step_transitions(steps[0].workflow_step_id).await.unwrap();
        assert_eq!(step_log[0].to_state, WorkflowStepState::Pending);
    }

    #[tokio::test]
    async fn test_dedup_against_non_terminal_tasks_only() {
        let store = InMemoryTaskStore::new();
        let first = store.create_task(new_task("same", &[])).await.unwrap();
        let second = store.create_task(new_task("same", &[])).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.task.task_id, second.task.task_id);

        store
            .transition_task(first.task.task_id, TaskState::Pending, TaskState::Complete, json!({}))
            .await
            .unwrap();

        let third = store.create_task(new_task("same", &[])).await.unwrap();
        assert!(third.created);
        assert_ne!(third.task.task_id, first.task.task_id);
    }

    #[tokio::test]
    async fn test_step_cas_detects_conflict_and_keeps_single_most_recent() {
        let store = InMemoryTaskStore::new();
        let creation = store.create_task(new_task("h", &["a"])).await.unwrap();
        let step_id = store.list_steps(creation.task.task_id).await.unwrap()[0].workflow_step_id;

        let claimed = store
            .transition_step(
                step_id,
                WorkflowStepState::Pending,
                WorkflowStepState::InProgress,
                json!({}),
                StepUpdate::new().inputs(json!({})),
            )
            .await
            .unwrap();
        assert_eq!(claimed.current_state, WorkflowStepState::InProgress);

        let lost = store
            .transition_step(
                step_id,
                WorkflowStepState::Pending,
                WorkflowStepState::InProgress,
                json!({}),
                StepUpdate::new(),
            )
            .await;
        assert!(matches!(lost, Err(PersistenceError::ConcurrentModification { .. })));

        let log = store.step_transitions(step_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().filter(|t| t.most_recent).count(), 1);
        assert_eq!(log[1].sort_key, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryTaskStore::new());
        let creation = store.create_task(new_task("race", &["a"])).await.unwrap();
        let step_id = store.list_steps(creation.task.task_id).await.unwrap()[0].workflow_step_id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition_step(
                        step_id,
                        WorkflowStepState::Pending,
                        WorkflowStepState::InProgress,
                        json!({}),
                        StepUpdate::new(),
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let store = InMemoryTaskStore::new();
        assert!(matches!(
            store.get_task(Uuid::new_v4()).await,
            Err(PersistenceError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_step(Uuid::new_v4()).await,
            Err(PersistenceError::NotFound { .. })
        ));
    }
}
