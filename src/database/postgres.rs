//! PostgreSQL [`TaskStore`].
//!
//! Schema lives in `migrations/`. Current state is the row of the transition
//! table flagged `most_recent`; a partial unique index guarantees there is at
//! most one. Transitions lock that row with `FOR UPDATE`, compare its
//! `to_state` with the expected state, then flip the flag and append the new
//! row in the same transaction. Task creation serializes on a
//! transaction-scoped advisory lock keyed by the identity hash.

use super::{NewTask, TaskCreation, TaskStore};
use crate::config::DatabaseConfig;
use crate::models::{
    StepUpdate, Task, TaskTransition, WorkflowStep, WorkflowStepEdge, WorkflowStepTransition,
};
use crate::state_machine::errors::{PersistenceError, PersistenceResult};
use crate::state_machine::{TaskState, WorkflowStepState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: Uuid,
    name: String,
    namespace: String,
    version: String,
    context: Value,
    identity_hash: String,
    initiator: Option<String>,
    source_system: Option<String>,
    reason: Option<String>,
    bypass_steps: Json<Vec<String>>,
    tags: Json<Vec<String>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            task_id: row.task_id,
            name: row.name,
            namespace: row.namespace,
            version: row.version,
            context: row.context,
            identity_hash: row.identity_hash,
            initiator: row.initiator,
            source_system: row.source_system,
            reason: row.reason,
            bypass_steps: row.bypass_steps.0,
            tags: row.tags.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    workflow_step_id: Uuid,
    task_id: Uuid,
    name: String,
    position: i32,
    current_state: Option<String>,
    retryable: bool,
    retry_limit: i32,
    skippable: bool,
    attempts: i32,
    inputs: Option<Value>,
    results: Option<Value>,
    processed: bool,
    processed_at: Option<DateTime<Utc>>,
    last_attempted_at: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StepRow> for WorkflowStep {
    type Error = PersistenceError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let current_state = match row.current_state.as_deref() {
            Some(state) => parse_state(state)?,
            None => WorkflowStepState::Pending,
        };
        Ok(Self {
            workflow_step_id: row.workflow_step_id,
            task_id: row.task_id,
            name: row.name,
            position: row.position,
            current_state,
            retryable: row.retryable,
            retry_limit: row.retry_limit,
            skippable: row.skippable,
            attempts: row.attempts,
            inputs: row.inputs,
            results: row.results,
            processed: row.processed,
            processed_at: row.processed_at,
            last_attempted_at: row.last_attempted_at,
            backoff_until: row.backoff_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    entity_id: Uuid,
    task_id: Uuid,
    from_state: Option<String>,
    to_state: String,
    sort_key: i32,
    most_recent: bool,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for TaskTransition {
    type Error = PersistenceError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: row.task_id,
            from_state: row.from_state.as_deref().map(parse_state).transpose()?,
            to_state: parse_state(&row.to_state)?,
            sort_key: row.sort_key,
            most_recent: row.most_recent,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<TransitionRow> for WorkflowStepTransition {
    type Error = PersistenceError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            workflow_step_id: row.entity_id,
            task_id: row.task_id,
            from_state: row.from_state.as_deref().map(parse_state).transpose()?,
            to_state: parse_state(&row.to_state)?,
            sort_key: row.sort_key,
            most_recent: row.most_recent,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CurrentTransitionRow {
    to_state: String,
    sort_key: i32,
}

fn parse_state<S: std::str::FromStr<Err = String>>(value: &str) -> PersistenceResult<S> {
    value
        .parse()
        .map_err(|field| PersistenceError::InvalidTransitionData { field })
}

const STEP_COLUMNS: &str = r#"
    s.workflow_step_id, s.task_id, s.name, s.position, tr.to_state AS current_state,
    s.retryable, s.retry_limit, s.skippable, s.attempts, s.inputs, s.results,
    s.processed, s.processed_at, s.last_attempted_at, s.backoff_until,
    s.created_at, s.updated_at
"#;

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the database section of the engine configuration
    pub async fn connect(config: &DatabaseConfig) -> PersistenceResult<Self> {
        let url = config.database_url().ok_or_else(|| {
            PersistenceError::Database(
                "No database URL configured (database.url or DATABASE_URL)".to_string(),
            )
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect(&url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> PersistenceResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PersistenceError::Database(format!("Migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_task_transition(
        tx: &mut Transaction<'_, Postgres>,
        task_id: Uuid,
        from_state: Option<TaskState>,
        to_state: TaskState,
        sort_key: i32,
        metadata: &Value,
    ) -> PersistenceResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO tasker_task_transitions
                (task_id, from_state, to_state, sort_key, most_recent, metadata)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            RETURNING created_at
            "#,
        )
        .bind(task_id)
        .bind(from_state.map(|s| s.as_str()))
        .bind(to_state.as_str())
        .bind(sort_key)
        .bind(metadata)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| PersistenceError::TransitionSaveFailed {
            reason: format!("Failed to insert task transition: {e}"),
        })?;
        Ok(created_at)
    }

    async fn insert_step_transition(
        tx: &mut Transaction<'_, Postgres>,
        step_id: Uuid,
        task_id: Uuid,
        from_state: Option<WorkflowStepState>,
        to_state: WorkflowStepState,
        sort_key: i32,
        metadata: &Value,
    ) -> PersistenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasker_workflow_step_transitions
                (workflow_step_id, task_id, from_state, to_state, sort_key, most_recent, metadata)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6)
            "#,
        )
        .bind(step_id)
        .bind(task_id)
        .bind(from_state.map(|s| s.as_str()))
        .bind(to_state.as_str())
        .bind(sort_key)
        .bind(metadata)
        .execute(&mut **tx)
        .await
        .map_err(|e| PersistenceError::TransitionSaveFailed {
            reason: format!("Failed to insert step transition: {e}"),
        })?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task(&self, new_task: NewTask) -> PersistenceResult<TaskCreation> {
        let NewTask { task, steps, edges } = new_task;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&task.identity_hash)
            .execute(&mut *tx)
            .await?;

        let existing: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT t.task_id, t.name, t.namespace, t.version, t.context, t.identity_hash,
                   t.initiator, t.source_system, t.reason, t.bypass_steps, t.tags,
                   t.created_at, t.updated_at
            FROM tasker_tasks t
            JOIN tasker_task_transitions tr ON tr.task_id = t.task_id AND tr.most_recent
            WHERE t.identity_hash = $1
              AND tr.to_state NOT IN ('complete', 'cancelled', 'resolved_manually')
            ORDER BY t.created_at
            LIMIT 1
            "#,
        )
        .bind(&task.identity_hash)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(TaskCreation {
                task: row.into(),
                created: false,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO tasker_tasks
                (task_id, name, namespace, version, context, identity_hash, initiator,
                 source_system, reason, bypass_steps, tags, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.task_id)
        .bind(&task.name)
        .bind(&task.namespace)
        .bind(&task.version)
        .bind(&task.context)
        .bind(&task.identity_hash)
        .bind(&task.initiator)
        .bind(&task.source_system)
        .bind(&task.reason)
        .bind(Json(&task.bypass_steps))
        .bind(Json(&task.tags))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        let initial_metadata = json!({"event": "initialize"});
        Self::insert_task_transition(&mut tx, task.task_id, None, TaskState::Pending, 0, &initial_metadata)
            .await?;

        for step in &steps {
            sqlx::query(
                r#"
                INSERT INTO tasker_workflow_steps
                    (workflow_step_id, task_id, name, position, retryable, retry_limit, skippable,
                     attempts, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(step.workflow_step_id)
            .bind(step.task_id)
            .bind(&step.name)
            .bind(step.position)
            .bind(step.retryable)
            .bind(step.retry_limit)
            .bind(step.skippable)
            .bind(step.attempts)
            .bind(step.created_at)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await?;

            Self::insert_step_transition(
                &mut tx,
                step.workflow_step_id,
                step.task_id,
                None,
                WorkflowStepState::Pending,
                0,
                &initial_metadata,
            )
            .await?;
        }

        for edge in &edges {
            sqlx::query(
                r#"
                INSERT INTO tasker_workflow_step_edges (task_id, from_step_id, to_step_id, name)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(edge.task_id)
            .bind(edge.from_step_id)
            .bind(edge.to_step_id)
            .bind(&edge.name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(TaskCreation { task, created: true })
    }

    async fn get_task(&self, task_id: Uuid) -> PersistenceResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT task_id, name, namespace, version, context, identity_hash, initiator,
                   source_system, reason, bypass_steps, tags, created_at, updated_at
            FROM tasker_tasks
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::from)
            .ok_or_else(|| PersistenceError::task_not_found(task_id))
    }

    async fn get_task_state(&self, task_id: Uuid) -> PersistenceResult<TaskState> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT to_state FROM tasker_task_transitions WHERE task_id = $1 AND most_recent",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match state {
            Some(state) => parse_state(&state),
            None => Err(PersistenceError::task_not_found(task_id)),
        }
    }

    async fn list_steps(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStep>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM tasker_workflow_steps s
            LEFT JOIN tasker_workflow_step_transitions tr
                ON tr.workflow_step_id = s.workflow_step_id AND tr.most_recent
            WHERE s.task_id = $1
            ORDER BY s.position
            "#
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowStep::try_from).collect()
    }

    async fn get_step(&self, step_id: Uuid) -> PersistenceResult<WorkflowStep> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM tasker_workflow_steps s
            LEFT JOIN tasker_workflow_step_transitions tr
                ON tr.workflow_step_id = s.workflow_step_id AND tr.most_recent
            WHERE s.workflow_step_id = $1
            "#
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| PersistenceError::step_not_found(step_id))?
            .try_into()
    }

    async fn list_edges(&self, task_id: Uuid) -> PersistenceResult<Vec<WorkflowStepEdge>> {
        let rows: Vec<(Uuid, Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT e.task_id, e.from_step_id, e.to_step_id, e.name
            FROM tasker_workflow_step_edges e
            JOIN tasker_workflow_steps s ON s.workflow_step_id = e.to_step_id
            WHERE e.task_id = $1
            ORDER BY s.position
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(task_id, from_step_id, to_step_id, name)| WorkflowStepEdge {
                task_id,
                from_step_id,
                to_step_id,
                name,
            })
            .collect())
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        expected_from: TaskState,
        to: TaskState,
        metadata: Value,
    ) -> PersistenceResult<TaskTransition> {
        let mut tx = self.pool.begin().await?;

        let current: Option<CurrentTransitionRow> = sqlx::query_as(
            r#"
            SELECT to_state, sort_key
            FROM tasker_task_transitions
            WHERE task_id = $1 AND most_recent
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        // A row updated by a concurrent transition no longer matches `most_recent`
        let Some(current) = current else {
            drop(tx);
            let actual = self.get_task_state(task_id).await?;
            return Err(PersistenceError::concurrent_modification(task_id, expected_from, actual));
        };

        let actual: TaskState = parse_state(&current.to_state)?;
        if actual != expected_from {
            return Err(PersistenceError::concurrent_modification(task_id, expected_from, actual));
        }

        sqlx::query("UPDATE tasker_task_transitions SET most_recent = FALSE WHERE task_id = $1 AND most_recent")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        let sort_key = current.sort_key + 1;
        let created_at =
            Self::insert_task_transition(&mut tx, task_id, Some(expected_from), to, sort_key, &metadata)
                .await?;

        sqlx::query("UPDATE tasker_tasks SET updated_at = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(TaskTransition {
            task_id,
            from_state: Some(expected_from),
            to_state: to,
            sort_key,
            most_recent: true,
            metadata,
            created_at,
        })
    }

    async fn transition_step(
        &self,
        step_id: Uuid,
        expected_from: WorkflowStepState,
        to: WorkflowStepState,
        metadata: Value,
        update: StepUpdate,
    ) -> PersistenceResult<WorkflowStep> {
        let mut tx = self.pool.begin().await?;

        let current: Option<CurrentTransitionRow> = sqlx::query_as(
            r#"
            SELECT to_state, sort_key
            FROM tasker_workflow_step_transitions
            WHERE workflow_step_id = $1 AND most_recent
            FOR UPDATE
            "#,
        )
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            drop(tx);
            let actual = self.get_step(step_id).await?.current_state;
            return Err(PersistenceError::concurrent_modification(step_id, expected_from, actual));
        };

        let actual: WorkflowStepState = parse_state(&current.to_state)?;
        if actual != expected_from {
            return Err(PersistenceError::concurrent_modification(step_id, expected_from, actual));
        }

        let (set_backoff, backoff_until) = match update.backoff_until {
            Some(value) => (true, value),
            None => (false, None),
        };

        let task_id: Uuid = sqlx::query_scalar(
            r#"
            UPDATE tasker_workflow_steps SET
                attempts = COALESCE($2, attempts),
                inputs = COALESCE($3, inputs),
                results = COALESCE($4, results),
                processed = COALESCE($5, processed),
                processed_at = COALESCE($6, processed_at),
                last_attempted_at = COALESCE($7, last_attempted_at),
                backoff_until = CASE WHEN $8 THEN $9 ELSE backoff_until END,
                updated_at = NOW()
            WHERE workflow_step_id = $1
            RETURNING task_id
            "#,
        )
        .bind(step_id)
        .bind(update.attempts)
        .bind(&update.inputs)
        .bind(&update.results)
        .bind(update.processed)
        .bind(update.processed_at)
        .bind(update.last_attempted_at)
        .bind(set_backoff)
        .bind(backoff_until)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasker_workflow_step_transitions SET most_recent = FALSE WHERE workflow_step_id = $1 AND most_recent",
        )
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        Self::insert_step_transition(
            &mut tx,
            step_id,
            task_id,
            Some(expected_from),
            to,
            current.sort_key + 1,
            &metadata,
        )
        .await?;

        tx.commit().await?;
        self.get_step(step_id).await
    }

    async fn task_transitions(&self, task_id: Uuid) -> PersistenceResult<Vec<TaskTransition>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r#"
            SELECT task_id AS entity_id, task_id, from_state, to_state, sort_key, most_recent,
                   metadata, created_at
            FROM tasker_task_transitions
            WHERE task_id = $1
            ORDER BY sort_key
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskTransition::try_from).collect()
    }

    async fn step_transitions(&self, step_id: Uuid) -> PersistenceResult<Vec<WorkflowStepTransition>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r#"
            SELECT workflow_step_id AS entity_id, task_id, from_state, to_state, sort_key,
                   most_recent, metadata, created_at
            FROM tasker_workflow_step_transitions
            WHERE workflow_step_id = $1
            ORDER BY sort_key
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowStepTransition::try_from).collect()
    }
}
