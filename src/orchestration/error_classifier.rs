//! # Step Failure Classification
//!
//! Decides what happens to a step after a failed attempt:
//!
//! ```text
//! permanent, or step not retryable        -> Permanent (terminal error)
//! retryable, attempts <  retry_limit      -> Retry at now + backoff
//! retryable, attempts >= retry_limit      -> Exhausted (terminal error)
//! ```
//!
//! `retry_limit` counts total attempts, the first included. Exhausted and
//! permanent failures both leave the step in `error`; the transition metadata
//! keeps them apart (`classification` and `exhausted`) for operator triage.

use crate::models::{RetryConfiguration, WorkflowStep};
use crate::orchestration::backoff_calculator::{BackoffCalculator, BackoffContext, BackoffResult};
use crate::orchestration::step_handler::{ErrorClassification, StepHandlerError};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// What to do with a step after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(BackoffResult),
    Exhausted,
    Permanent,
}

/// Classified failure plus the metadata recorded on the `error` transition
#[derive(Debug, Clone, PartialEq)]
pub struct FailureClassification {
    /// Effective classification; a non-retryable step makes every failure permanent
    pub classification: ErrorClassification,
    pub decision: RetryDecision,
    pub attempts: i32,
    pub retry_limit: i32,
    pub metadata: Value,
}

impl FailureClassification {
    pub fn exhausted(&self) -> bool {
        matches!(self.decision, RetryDecision::Exhausted)
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match &self.decision {
            RetryDecision::Retry(backoff) => Some(backoff.next_retry_at),
            _ => None,
        }
    }

    /// Drop a scheduled retry, e.g. because the task was cancelled meanwhile
    pub fn without_retry(mut self, reason: &str) -> Self {
        if matches!(self.decision, RetryDecision::Retry(_)) {
            self.decision = RetryDecision::Permanent;
            if let Value::Object(map) = &mut self.metadata {
                map.remove("backoff_until");
                map.insert("retry_suppressed".to_string(), json!(reason));
            }
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    backoff: BackoffCalculator,
}

impl ErrorClassifier {
    pub fn new(backoff: BackoffCalculator) -> Self {
        Self { backoff }
    }

    /// Classify a failure of `step`.
    ///
    /// `attempts` already includes the failed attempt.
    pub fn classify(
        &self,
        step: &WorkflowStep,
        retry: &RetryConfiguration,
        error: &StepHandlerError,
        attempts: i32,
        now: DateTime<Utc>,
    ) -> FailureClassification {
        let classification = if step.retryable {
            error.classification
        } else {
            ErrorClassification::Permanent
        };

        let decision = match classification {
            ErrorClassification::Permanent => RetryDecision::Permanent,
            ErrorClassification::Retryable if attempts >= step.retry_limit => {
                RetryDecision::Exhausted
            }
            ErrorClassification::Retryable => {
                let context = BackoffContext::new(attempts.max(0) as u32)
                    .with_retry_after(error.retry_after);
                RetryDecision::Retry(self.backoff.calculate_for_step(retry, &context, now))
            }
        };

        let mut metadata = Map::new();
        metadata.insert("error".to_string(), json!(error.message));
        if let Some(code) = &error.error_code {
            metadata.insert("error_code".to_string(), json!(code));
        }
        metadata.insert("classification".to_string(), json!(classification.as_str()));
        metadata.insert("attempts".to_string(), json!(attempts));
        metadata.insert("retry_limit".to_string(), json!(step.retry_limit));
        metadata.insert(
            "exhausted".to_string(),
            json!(matches!(decision, RetryDecision::Exhausted)),
        );
        if let RetryDecision::Retry(backoff) = &decision {
            metadata.insert("backoff_until".to_string(), json!(backoff.next_retry_at));
            metadata.insert(
                "backoff_ms".to_string(),
                json!(backoff.delay.as_millis() as u64),
            );
        }
        if !error.metadata.is_empty() {
            metadata.insert("details".to_string(), json!(error.metadata));
        }

        FailureClassification {
            classification,
            decision,
            attempts,
            retry_limit: step.retry_limit,
            metadata: Value::Object(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::backoff_calculator::BackoffCalculatorConfig;
    use std::time::Duration;
    use uuid::Uuid;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(BackoffCalculator::new(
            BackoffCalculatorConfig::default().without_jitter(),
        ))
    }

    fn step(retryable: bool, retry_limit: i32) -> WorkflowStep {
        WorkflowStep::new(Uuid::new_v4(), "fetch", 0, retryable, retry_limit, false)
    }

    #[test]
    fn test_retryable_within_budget_schedules_retry() {
        let now = Utc::now();
        let failure = classifier().classify(
            &step(true, 3),
            &RetryConfiguration::default(),
            &StepHandlerError::retryable("timeout"),
            1,
            now,
        );
        assert!(matches!(failure.decision, RetryDecision::Retry(_)));
        assert!(failure.next_retry_at().unwrap() > now);
        assert_eq!(failure.metadata["classification"], "retryable");
        assert_eq!(failure.metadata["exhausted"], false);
        assert!(failure.metadata.get("backoff_until").is_some());
    }

    #[test]
    fn test_retryable_at_limit_is_exhausted() {
        let failure = classifier().classify(
            &step(true, 3),
            &RetryConfiguration::default(),
            &StepHandlerError::retryable("timeout"),
            3,
            Utc::now(),
        );
        assert!(failure.exhausted());
        assert_eq!(failure.classification, ErrorClassification::Retryable);
        assert_eq!(failure.metadata["exhausted"], true);
        assert_eq!(failure.metadata["attempts"], 3);
        assert!(failure.metadata.get("backoff_until").is_none());
    }

    #[test]
    fn test_permanent_and_non_retryable_steps() {
        let permanent = classifier().classify(
            &step(true, 3),
            &RetryConfiguration::default(),
            &StepHandlerError::permanent("bad input").with_error_code("invalid"),
            1,
            Utc::now(),
        );
        assert_eq!(permanent.decision, RetryDecision::Permanent);
        assert_eq!(permanent.metadata["error_code"], "invalid");

        let not_retryable = classifier().classify(
            &step(false, 3),
            &RetryConfiguration::default(),
            &StepHandlerError::retryable("timeout"),
            1,
            Utc::now(),
        );
        assert_eq!(not_retryable.decision, RetryDecision::Permanent);
        assert_eq!(not_retryable.metadata["classification"], "permanent");
    }

    #[test]
    fn test_retry_after_and_suppression() {
        let now = Utc::now();
        let failure = classifier().classify(
            &step(true, 5),
            &RetryConfiguration::default(),
            &StepHandlerError::retryable("rate limited").with_retry_after(Duration::from_secs(2)),
            1,
            now,
        );
        assert_eq!(failure.next_retry_at(), Some(now + chrono::Duration::seconds(2)));

        let suppressed = failure.without_retry("task_cancelled");
        assert_eq!(suppressed.decision, RetryDecision::Permanent);
        assert_eq!(suppressed.metadata["retry_suppressed"], "task_cancelled");
        assert!(suppressed.metadata.get("backoff_until").is_none());
    }
}
