//! Task identity strategies.
//!
//! The identity hash decides whether a submission is a duplicate of an
//! existing non-terminal task. Strategies are pluggable through
//! [`IdentityHasher`]; the engine ships [`StrategyIdentityHasher`].

use crate::error::{Result, TaskerError};
use crate::models::task::TaskRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Hash of namespace, name, version and canonical context
    #[default]
    Strict,
    /// Hash of the caller's `idempotency_key`
    CallerProvided,
    /// Every submission gets a fresh identity; no deduplication
    AlwaysUnique,
}

impl std::fmt::Display for IdentityStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::CallerProvided => write!(f, "caller_provided"),
            Self::AlwaysUnique => write!(f, "always_unique"),
        }
    }
}

impl std::str::FromStr for IdentityStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "caller_provided" => Ok(Self::CallerProvided),
            "always_unique" => Ok(Self::AlwaysUnique),
            _ => Err(format!("Invalid identity strategy: {s}")),
        }
    }
}

/// Computes the identity hash of a task request
pub trait IdentityHasher: Send + Sync {
    fn identity_hash(&self, request: &TaskRequest, version: &str) -> Result<String>;
}

/// Hasher that applies the request's strategy, or a configured default
#[derive(Debug, Clone, Default)]
pub struct StrategyIdentityHasher {
    default_strategy: IdentityStrategy,
}

impl StrategyIdentityHasher {
    pub fn new(default_strategy: IdentityStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> IdentityStrategy {
        self.default_strategy
    }
}

impl IdentityHasher for StrategyIdentityHasher {
    fn identity_hash(&self, request: &TaskRequest, version: &str) -> Result<String> {
        let strategy = request.identity_strategy.unwrap_or(self.default_strategy);
        match strategy {
            IdentityStrategy::Strict => {
                let material = format!(
                    "{}\u{1f}{}\u{1f}{}\u{1f}{}",
                    request.namespace,
                    request.name,
                    version,
                    canonical_json(&request.context)
                );
                Ok(sha256_hex(material.as_bytes()))
            }
            IdentityStrategy::CallerProvided => {
                let key = request
                    .idempotency_key
                    .as_deref()
                    .filter(|key| !key.trim().is_empty())
                    .ok_or_else(|| {
                        TaskerError::InvalidInput(format!(
                            "Task {}/{} requires an idempotency_key under the caller_provided identity strategy",
                            request.namespace, request.name
                        ))
                    })?;
                let material = format!("{}\u{1f}{}\u{1f}{}", request.namespace, request.name, key);
                Ok(sha256_hex(material.as_bytes()))
            }
            IdentityStrategy::AlwaysUnique => Ok(sha256_hex(Uuid::new_v4().as_bytes())),
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// JSON rendering with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_hash_ignores_key_order() {
        let hasher = StrategyIdentityHasher::new(IdentityStrategy::Strict);
        let a = TaskRequest::new("t", "ns").with_context(json!({"a": 1, "b": {"y": 2, "x": 1}}));
        let b = TaskRequest::new("t", "ns").with_context(json!({"b": {"x": 1, "y": 2}, "a": 1}));
        assert_eq!(
            hasher.identity_hash(&a, "1.0.0").unwrap(),
            hasher.identity_hash(&b, "1.0.0").unwrap()
        );
    }

    #[test]
    fn test_strict_hash_distinguishes_namespace_and_context() {
        let hasher = StrategyIdentityHasher::new(IdentityStrategy::Strict);
        let base = TaskRequest::new("t", "ns").with_context(json!({"a": 1}));
        let other_ns = TaskRequest::new("t", "other").with_context(json!({"a": 1}));
        let other_ctx = TaskRequest::new("t", "ns").with_context(json!({"a": 2}));
        let h = hasher.identity_hash(&base, "1.0.0").unwrap();
        assert_ne!(h, hasher.identity_hash(&other_ns, "1.0.0").unwrap());
        assert_ne!(h, hasher.identity_hash(&other_ctx, "1.0.0").unwrap());
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn test_caller_provided_requires_key() {
        let hasher = StrategyIdentityHasher::new(IdentityStrategy::CallerProvided);
        let missing = TaskRequest::new("t", "ns");
        assert!(matches!(
            hasher.identity_hash(&missing, "1.0.0"),
            Err(TaskerError::InvalidInput(_))
        ));

        let a = TaskRequest::new("t", "ns")
            .with_context(json!({"a": 1}))
            .with_idempotency_key("k-1");
        let b = TaskRequest::new("t", "ns")
            .with_context(json!({"a": 2}))
            .with_idempotency_key("k-1");
        assert_eq!(
            hasher.identity_hash(&a, "1.0.0").unwrap(),
            hasher.identity_hash(&b, "1.0.0").unwrap()
        );
    }

    #[test]
    fn test_request_override_wins() {
        let hasher = StrategyIdentityHasher::new(IdentityStrategy::Strict);
        let request = TaskRequest::new("t", "ns").with_identity_strategy(IdentityStrategy::AlwaysUnique);
        assert_ne!(
            hasher.identity_hash(&request, "1.0.0").unwrap(),
            hasher.identity_hash(&request, "1.0.0").unwrap()
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("caller_provided".parse::<IdentityStrategy>().unwrap(), IdentityStrategy::CallerProvided);
        assert!("fuzzy".parse::<IdentityStrategy>().is_err());
        assert_eq!(IdentityStrategy::AlwaysUnique.to_string(), "always_unique");
    }
}
