//! # Task Model
//!
//! A `Task` is one instantiation of a registered task template: the template's
//! step DAG plus the caller's context. Tasks are created on submission, mutated
//! only through state-machine transitions, and never deleted by the engine;
//! terminal tasks are retained for audit.
//!
//! ## Identity
//!
//! `identity_hash` is what duplicate submissions are detected by. It is derived
//! by an [`IdentityHasher`](super::identity_strategy::IdentityHasher) according
//! to the configured [`IdentityStrategy`](super::identity_strategy::IdentityStrategy),
//! and a submission whose hash matches an existing non-terminal task returns
//! that task instead of creating a new one.

use crate::constants::system::{DEFAULT_NAMESPACE, DEFAULT_TASK_VERSION};
use crate::models::identity_strategy::IdentityStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Persisted task instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    /// Template name
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub context: Value,
    pub identity_hash: String,
    pub initiator: Option<String>,
    pub source_system: Option<String>,
    pub reason: Option<String>,
    /// Skippable steps to transition straight to `skipped` without invoking a handler
    pub bypass_steps: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a new, not yet persisted task from a request and its computed identity
    pub fn from_request(request: &TaskRequest, version: String, identity_hash: String) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            version,
            context: request.context.clone(),
            identity_hash,
            initiator: request.initiator.clone(),
            source_system: request.source_system.clone(),
            reason: request.reason.clone(),
            bypass_steps: request.bypass_steps.clone(),
            tags: request.tags.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `namespace/name@version`, used in logs
    pub fn qualified_name(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.version)
    }

    pub fn is_bypassed(&self, step_name: &str) -> bool {
        self.bypass_steps.iter().any(|name| name == step_name)
    }
}

/// Incoming request to create and execute a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub namespace: String,
    /// Template version; `None` selects the highest registered version
    pub version: Option<String>,
    pub context: Value,
    pub initiator: Option<String>,
    pub source_system: Option<String>,
    pub reason: Option<String>,
    pub bypass_steps: Vec<String>,
    pub tags: Vec<String>,
    /// Caller-supplied deduplication key, required by `IdentityStrategy::CallerProvided`
    pub idempotency_key: Option<String>,
    /// Per-request override of the configured identity strategy
    pub identity_strategy: Option<IdentityStrategy>,
}

impl Default for TaskRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            version: None,
            context: Value::Object(serde_json::Map::new()),
            initiator: None,
            source_system: None,
            reason: None,
            bypass_steps: Vec::new(),
            tags: Vec::new(),
            idempotency_key: None,
            identity_strategy: None,
        }
    }
}

impl TaskRequest {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }

    pub fn with_source_system(mut self, source_system: impl Into<String>) -> Self {
        self.source_system = Some(source_system.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_bypass_steps(mut self, steps: Vec<String>) -> Self {
        self.bypass_steps = steps;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_identity_strategy(mut self, strategy: IdentityStrategy) -> Self {
        self.identity_strategy = Some(strategy);
        self
    }

    /// Version used for identity hashing when the request leaves it open
    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_TASK_VERSION)
    }
}
