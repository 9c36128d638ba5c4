//! Step handlers shared by the integration tests.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_engine::orchestration::{
    handler_fn, StepExecutionContext, StepHandler, StepHandlerError, StepHandlerResult,
};

/// Records step names in the order their handlers started
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, step_name: &str) {
        self.entries.lock().push(step_name.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, step_name: &str) -> usize {
        self.entries.lock().iter().filter(|s| *s == step_name).count()
    }

    pub fn position(&self, step_name: &str) -> Option<usize> {
        self.entries.lock().iter().position(|s| s == step_name)
    }
}

/// Tracks how many handlers are running at once
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Completes with the step name and the names of the dependency results it saw
pub fn recording_handler(log: ExecutionLog) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        async move {
            log.record(&ctx.step.name);
            let mut inputs: Vec<String> = ctx.dependency_results.keys().cloned().collect();
            inputs.sort();
            Ok(StepHandlerResult::Complete(json!({
                "step": ctx.step.name,
                "inputs": inputs,
            })))
        }
    })
}

/// Sleeps while counted by the gauge, then completes
pub fn slow_handler(
    log: ExecutionLog,
    gauge: ConcurrencyGauge,
    delay: Duration,
) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        let gauge = gauge.clone();
        async move {
            log.record(&ctx.step.name);
            gauge.enter();
            tokio::time::sleep(delay).await;
            gauge.exit();
            Ok(StepHandlerResult::Complete(json!({ "step": ctx.step.name })))
        }
    })
}

/// Always fails with a retryable error
pub fn always_failing_handler(log: ExecutionLog) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        async move {
            log.record(&ctx.step.name);
            Err(StepHandlerError::retryable(format!(
                "attempt {} of {} failed",
                ctx.attempt_number(),
                ctx.step.retry_limit
            ))
            .with_error_code("upstream_unavailable"))
        }
    })
}

/// Fails with a retryable error until the given attempt number, then completes
pub fn flaky_handler(log: ExecutionLog, succeed_on_attempt: i32) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        async move {
            log.record(&ctx.step.name);
            if ctx.attempt_number() < succeed_on_attempt {
                Err(StepHandlerError::retryable("transient failure"))
            } else {
                Ok(StepHandlerResult::Complete(
                    json!({ "attempt": ctx.attempt_number() }),
                ))
            }
        }
    })
}

/// Fails permanently on every attempt
pub fn permanent_failure_handler(log: ExecutionLog) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        async move {
            log.record(&ctx.step.name);
            Err(StepHandlerError::permanent("card declined").with_error_code("card_declined"))
        }
    })
}

/// Skips itself
pub fn skipping_handler(log: ExecutionLog) -> Arc<dyn StepHandler> {
    handler_fn(move |ctx: StepExecutionContext| {
        let log = log.clone();
        async move {
            log.record(&ctx.step.name);
            Ok(StepHandlerResult::skipped("nothing to do"))
        }
    })
}
