//! End-to-end coordinator scenarios over the in-memory store.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tasker_engine::constants::system::{CLAIM_EXPIRED_ERROR_CODE, SKIP_NOT_ALLOWED_ERROR_CODE};
use tasker_engine::database::TaskStore;
use tasker_engine::models::{StepUpdate, TaskRequest};
use tasker_engine::orchestration::{OrchestrationError, TaskOrchestrationResult};
use tasker_engine::state_machine::{TaskState, WorkflowStepState};

const LINEAR: &str = r#"
name: linear
namespace_name: scenarios
version: 1.0.0
steps:
  - name: a
    handler: { callable: record }
  - name: b
    dependency: a
    handler: { callable: record }
  - name: c
    dependency: b
    handler: { callable: record }
"#;

const DIAMOND: &str = r#"
name: diamond
namespace_name: scenarios
version: 1.0.0
steps:
  - name: a
    handler: { callable: record }
  - name: b
    dependency: a
    handler: { callable: slow }
  - name: c
    dependency: a
    handler: { callable: slow }
  - name: d
    dependencies: [b, c]
    handler: { callable: record }
"#;

const FLAKY: &str = r#"
name: flaky
namespace_name: scenarios
version: 1.0.0
steps:
  - name: a
    handler: { callable: record }
  - name: b
    dependency: a
    handler: { callable: failing }
    retry:
      retry_limit: 3
      backoff_base_ms: 5
  - name: c
    dependency: b
    handler: { callable: record }
"#;

const SKIPPING: &str = r#"
name: skipping
namespace_name: scenarios
version: 1.0.0
steps:
  - name: a
    handler: { callable: record }
  - name: optional
    dependency: a
    skippable: true
    handler: { callable: skip }
  - name: required
    dependency: a
    handler: { callable: skip }
  - name: after_optional
    dependency: optional
    handler: { callable: record }
"#;

fn recording_engine(log: &ExecutionLog) -> TestEngine {
    TestEngine::new().handler("record", recording_handler(log.clone()))
}

#[tokio::test]
async fn test_linear_task_runs_in_dependency_order() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log).template(LINEAR).build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("linear", "scenarios").with_context(json!({"id": 1})))
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(log.entries(), vec!["a", "b", "c"]);

    let task_id = result.task_id();
    for name in ["a", "b", "c"] {
        let step = step_named(store.as_ref(), task_id, name).await;
        assert_eq!(step.current_state, WorkflowStepState::Complete);
        assert_eq!(step.attempts, 1);
        assert!(step.processed);
        assert_eq!(
            step_state_path(store.as_ref(), step.workflow_step_id).await,
            vec![
                WorkflowStepState::Pending,
                WorkflowStepState::InProgress,
                WorkflowStepState::Complete
            ]
        );
    }

    let c = step_named(store.as_ref(), task_id, "c").await;
    assert_eq!(c.results, Some(json!({"step": "c", "inputs": ["b"]})));

    let task_path: Vec<TaskState> = store
        .task_transitions(task_id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.to_state)
        .collect();
    assert_eq!(
        task_path,
        vec![TaskState::Pending, TaskState::InProgress, TaskState::Complete]
    );
}

#[tokio::test]
async fn test_diamond_runs_independent_branches_concurrently() {
    let log = ExecutionLog::new();
    let gauge = ConcurrencyGauge::new();
    let (coordinator, store) = recording_engine(&log)
        .handler(
            "slow",
            slow_handler(log.clone(), gauge.clone(), Duration::from_millis(100)),
        )
        .template(DIAMOND)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("diamond", "scenarios"))
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(gauge.peak(), 2, "b and c should overlap");
    let d = log.position("d").unwrap();
    assert!(log.position("b").unwrap() < d);
    assert!(log.position("c").unwrap() < d);

    let d_step = step_named(store.as_ref(), result.task_id(), "d").await;
    assert_eq!(d_step.results, Some(json!({"step": "d", "inputs": ["b", "c"]})));
}

#[tokio::test]
async fn test_retry_exhaustion_fails_the_task() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .handler("failing", always_failing_handler(log.clone()))
        .template(FLAKY)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("flaky", "scenarios"))
        .await
        .unwrap();

    assert_eq!(log.count("b"), 3);
    assert_eq!(log.count("c"), 0);

    let TaskOrchestrationResult::Failed {
        task_id,
        failed_steps,
        ..
    } = result
    else {
        panic!("expected a failed task, got {result:?}");
    };
    assert_eq!(failed_steps.len(), 1);
    let failed = &failed_steps[0];
    assert_eq!(failed.name, "b");
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.retry_limit, 3);
    assert!(failed.exhausted);
    assert_eq!(failed.classification.as_deref(), Some("retryable"));
    assert_eq!(failed.error_code.as_deref(), Some("upstream_unavailable"));

    assert_eq!(store.get_task_state(task_id).await.unwrap(), TaskState::Error);
    let c = step_named(store.as_ref(), task_id, "c").await;
    assert_eq!(c.current_state, WorkflowStepState::Pending);

    let b = step_named(store.as_ref(), task_id, "b").await;
    assert_eq!(
        step_state_path(store.as_ref(), b.workflow_step_id).await,
        vec![
            WorkflowStepState::Pending,
            WorkflowStepState::InProgress,
            WorkflowStepState::Error,
            WorkflowStepState::Pending,
            WorkflowStepState::InProgress,
            WorkflowStepState::Error,
            WorkflowStepState::Pending,
            WorkflowStepState::InProgress,
            WorkflowStepState::Error,
        ]
    );
}

#[tokio::test]
async fn test_transient_failure_recovers_within_retry_budget() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .handler("failing", flaky_handler(log.clone(), 2))
        .template(FLAKY)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("flaky", "scenarios"))
        .await
        .unwrap();

    assert!(result.is_complete());
    let b = step_named(store.as_ref(), result.task_id(), "b").await;
    assert_eq!(b.attempts, 2);
    assert_eq!(b.results, Some(json!({"attempt": 2})));
    assert!(b.backoff_until.is_none());
}

#[tokio::test]
async fn test_skipped_step_satisfies_dependents_but_unskippable_skip_fails() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .handler("skip", skipping_handler(log.clone()))
        .template(SKIPPING)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("skipping", "scenarios"))
        .await
        .unwrap();
    let task_id = result.task_id();

    let optional = step_named(store.as_ref(), task_id, "optional").await;
    assert_eq!(optional.current_state, WorkflowStepState::Skipped);
    assert_eq!(log.count("after_optional"), 1);

    let TaskOrchestrationResult::Failed { failed_steps, .. } = result else {
        panic!("a non-skippable step skipping itself should fail the task");
    };
    assert_eq!(failed_steps[0].name, "required");
    assert_eq!(failed_steps[0].classification.as_deref(), Some("permanent"));
    assert_eq!(
        failed_steps[0].error_code.as_deref(),
        Some(SKIP_NOT_ALLOWED_ERROR_CODE)
    );
}

#[tokio::test]
async fn test_bypass_requires_skippable_steps() {
    let log = ExecutionLog::new();
    let (coordinator, _store) = recording_engine(&log)
        .handler("skip", skipping_handler(log.clone()))
        .template(SKIPPING)
        .build();

    let err = coordinator
        .submit_task(
            TaskRequest::new("skipping", "scenarios").with_bypass_steps(vec!["required".into()]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidRequest { .. }));
}

#[tokio::test]
async fn test_cancel_with_step_in_flight() {
    let log = ExecutionLog::new();
    let gauge = ConcurrencyGauge::new();
    let (coordinator, store) = TestEngine::new()
        .handler(
            "record",
            slow_handler(log.clone(), gauge.clone(), Duration::from_millis(150)),
        )
        .template(LINEAR)
        .build();
    let coordinator = Arc::new(coordinator);

    let created = coordinator
        .submit_task(TaskRequest::new("linear", "scenarios"))
        .await
        .unwrap();
    let task_id = created.task_id();

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.execute_task(task_id).await })
    };

    let started = wait_until(Duration::from_secs(2), || {
        let store = store.clone();
        async move {
            step_named(store.as_ref(), task_id, "a").await.current_state
                == WorkflowStepState::InProgress
        }
    })
    .await;
    assert!(started, "step a should be claimed");

    let cancelled = coordinator.cancel_task(task_id, "customer withdrew").await.unwrap();
    assert_eq!(cancelled, 2);

    let result = runner.await.unwrap().unwrap();
    assert_eq!(result, TaskOrchestrationResult::Cancelled { task_id });

    assert_eq!(log.entries(), vec!["a"]);
    let a = step_named(store.as_ref(), task_id, "a").await;
    assert_eq!(a.current_state, WorkflowStepState::Complete);
    for name in ["b", "c"] {
        let step = step_named(store.as_ref(), task_id, name).await;
        assert_eq!(step.current_state, WorkflowStepState::Cancelled);
    }

    let err = coordinator.cancel_task(task_id, "again").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidTaskState { .. }));
}

#[tokio::test]
async fn test_task_without_steps_completes_immediately() {
    let (coordinator, store) = TestEngine::new()
        .template("name: empty\nnamespace_name: scenarios\nversion: 1.0.0\nsteps: []\n")
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("empty", "scenarios"))
        .await
        .unwrap();

    let TaskOrchestrationResult::Complete { steps_executed, .. } = result else {
        panic!("expected completion, got {result:?}");
    };
    assert_eq!(steps_executed, 0);
    assert_eq!(
        store.get_task_state(result.task_id()).await.unwrap(),
        TaskState::Complete
    );
}

#[tokio::test]
async fn test_stale_claim_is_recovered_as_failed_attempt() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .template(LINEAR)
        .coordinator_config(|c| c.stale_claim_timeout = Duration::from_secs(1))
        .build();

    let created = coordinator
        .submit_task(TaskRequest::new("linear", "scenarios"))
        .await
        .unwrap();
    let task_id = created.task_id();

    // a coordinator claimed `a` an hour ago and never came back
    let a = step_named(store.as_ref(), task_id, "a").await;
    store
        .transition_step(
            a.workflow_step_id,
            WorkflowStepState::Pending,
            WorkflowStepState::InProgress,
            json!({ "attempt": 1 }),
            StepUpdate::new().last_attempted_at(chrono::Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let result = coordinator.execute_task(task_id).await.unwrap();
    assert!(result.is_complete());

    let a = step_named(store.as_ref(), task_id, "a").await;
    assert_eq!(a.attempts, 2);
    assert_eq!(log.count("a"), 1);

    let transitions = store.step_transitions(a.workflow_step_id).await.unwrap();
    let expired = transitions
        .iter()
        .find(|t| t.to_state == WorkflowStepState::Error)
        .expect("the abandoned claim should be recorded as an error");
    assert_eq!(expired.metadata["error_code"], CLAIM_EXPIRED_ERROR_CODE);
    assert_eq!(expired.metadata["classification"], "retryable");
}

#[tokio::test]
async fn test_duplicate_submission_deduplicates_until_terminal() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log).template(LINEAR).build();
    let request = || TaskRequest::new("linear", "scenarios").with_context(json!({"order": 9}));

    let first = coordinator.submit_task(request()).await.unwrap();
    let second = coordinator.submit_task(request()).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.task_id(), second.task_id());
    assert_eq!(store.task_count(), 1);

    coordinator.execute_task(first.task_id()).await.unwrap();

    let third = coordinator.submit_task(request()).await.unwrap();
    assert!(third.created);
    assert_ne!(third.task_id(), first.task_id());
    assert_eq!(store.task_count(), 2);
}

#[tokio::test]
async fn test_manual_step_resolution_then_reset_resumes_the_task() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .handler("failing", permanent_failure_handler(log.clone()))
        .template(FLAKY)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("flaky", "scenarios"))
        .await
        .unwrap();
    assert!(result.is_failed());
    let task_id = result.task_id();
    assert_eq!(log.count("b"), 1, "permanent failures are not retried");

    let b = step_named(store.as_ref(), task_id, "b").await;
    let resolved = coordinator
        .resolve_step_manually(b.workflow_step_id, "charged by phone")
        .await
        .unwrap();
    assert_eq!(resolved.current_state, WorkflowStepState::ResolvedManually);

    let err = coordinator
        .resolve_step_manually(b.workflow_step_id, "twice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidStepState { .. }));

    coordinator.reset_task(task_id, "step b resolved").await.unwrap();
    assert_eq!(store.get_task_state(task_id).await.unwrap(), TaskState::Pending);

    let resumed = coordinator.execute_task(task_id).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(log.count("c"), 1);
    let c = step_named(store.as_ref(), task_id, "c").await;
    assert_eq!(c.current_state, WorkflowStepState::Complete);
}

#[tokio::test]
async fn test_manual_task_resolution_is_terminal() {
    let log = ExecutionLog::new();
    let (coordinator, store) = recording_engine(&log)
        .handler("failing", permanent_failure_handler(log.clone()))
        .template(FLAKY)
        .build();

    let result = coordinator
        .submit_and_execute(TaskRequest::new("flaky", "scenarios"))
        .await
        .unwrap();
    let task_id = result.task_id();

    coordinator
        .resolve_task_manually(task_id, "order refunded")
        .await
        .unwrap();
    assert_eq!(
        store.get_task_state(task_id).await.unwrap(),
        TaskState::ResolvedManually
    );
    assert_eq!(
        coordinator.execute_task(task_id).await.unwrap(),
        TaskOrchestrationResult::ResolvedManually { task_id }
    );
    assert!(coordinator.reset_task(task_id, "too late").await.is_err());
}

#[tokio::test]
async fn test_storage_failure_is_returned_to_the_caller() {
    let log = ExecutionLog::new();
    let store = Arc::new(FailingStore::new());
    let coordinator = recording_engine(&log)
        .template(LINEAR)
        .build_with_store(store.clone());

    let created = coordinator
        .submit_task(TaskRequest::new("linear", "scenarios"))
        .await
        .unwrap();
    store.arm();

    let err = coordinator.execute_task(created.task_id()).await.unwrap_err();
    assert!(err.is_storage_error(), "unexpected error: {err:?}");
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_cancel_racing_a_claim_never_runs_the_handler() {
    let log = ExecutionLog::new();
    let store = Arc::new(FailingStore::new());
    let coordinator = recording_engine(&log)
        .template(LINEAR)
        .build_with_store(store.clone());

    let created = coordinator
        .submit_task(TaskRequest::new("linear", "scenarios"))
        .await
        .unwrap();
    let task_id = created.task_id();
    store.cancel_on_next_claim();

    let result = coordinator.execute_task(task_id).await.unwrap();
    assert!(matches!(result, TaskOrchestrationResult::Cancelled { .. }));
    assert!(log.entries().is_empty(), "handler ran after the task was cancelled");
    assert_eq!(store.get_task_state(task_id).await.unwrap(), TaskState::Cancelled);

    let a = step_named(store.as_ref(), task_id, "a").await;
    assert_eq!(a.current_state, WorkflowStepState::Cancelled);
    assert_eq!(a.attempts, 0);
    assert_eq!(
        step_state_path(store.as_ref(), a.workflow_step_id).await,
        vec![
            WorkflowStepState::Pending,
            WorkflowStepState::InProgress,
            WorkflowStepState::Cancelled
        ]
    );
}

#[tokio::test]
async fn test_execution_context_reports_progress() {
    let log = ExecutionLog::new();
    let (coordinator, _store) = recording_engine(&log).template(LINEAR).build();

    let created = coordinator
        .submit_task(TaskRequest::new("linear", "scenarios"))
        .await
        .unwrap();
    let context = coordinator
        .task_execution_context(created.task_id())
        .await
        .unwrap();
    assert_eq!(context.total_steps, 3);
    assert_eq!(context.pending_steps, 3);
    assert_eq!(context.ready_steps, 1);
    assert_eq!(context.completion_percentage, 0.0);

    coordinator.execute_task(created.task_id()).await.unwrap();
    let context = coordinator
        .task_execution_context(created.task_id())
        .await
        .unwrap();
    assert_eq!(context.completed_steps, 3);
    assert_eq!(context.status, TaskState::Complete);
    assert_eq!(context.completion_percentage, 100.0);
}
