//! # Backoff Calculator
//!
//! Computes when a retryable step may be attempted again.
//!
//! The delay is exponential in the number of attempts already made before the
//! failing one: `base * multiplier^(attempts - 1)`, clamped to the maximum,
//! then spread by a random jitter of up to `jitter_max_percentage` of the
//! delay in either direction. A handler-supplied `retry_after` replaces the
//! exponential delay but is still held to the maximum.

use crate::config::BackoffConfig;
use crate::models::RetryConfiguration;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Fraction of the computed delay, 0.0 to 1.0
    pub max_jitter: f64,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffCalculatorConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_enabled: config.jitter_enabled,
            max_jitter: config.jitter_max_percentage.clamp(0.0, 1.0),
        }
    }
}

impl BackoffCalculatorConfig {
    /// Apply a step's own base and maximum, keeping `base <= max`
    pub fn with_step_overrides(&self, retry: &RetryConfiguration) -> Self {
        let mut config = self.clone();
        if let Some(base) = retry.backoff_base_ms {
            config.base_delay_ms = base;
        }
        if let Some(max) = retry.max_backoff_ms {
            config.max_delay_ms = max;
        }
        config.max_delay_ms = config.max_delay_ms.max(config.base_delay_ms);
        config
    }

    /// No jitter, for deterministic schedules in tests
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }
}

/// Inputs for one backoff calculation
#[derive(Debug, Clone, Default)]
pub struct BackoffContext {
    /// Attempts made so far, including the one that just failed
    pub attempts: u32,
    /// Server-requested delay from the handler
    pub retry_after: Option<Duration>,
}

impl BackoffContext {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Delay requested by the handler
    ServerRequested,
    /// Exponential backoff with jitter
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffResult {
    pub delay: Duration,
    pub backoff_type: BackoffType,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Calculate the next retry time with the engine-wide parameters
    pub fn calculate(&self, context: &BackoffContext, now: DateTime<Utc>) -> BackoffResult {
        Self::calculate_with(&self.config, context, now)
    }

    /// Calculate with a step's overrides applied
    pub fn calculate_for_step(
        &self,
        retry: &RetryConfiguration,
        context: &BackoffContext,
        now: DateTime<Utc>,
    ) -> BackoffResult {
        Self::calculate_with(&self.config.with_step_overrides(retry), context, now)
    }

    fn calculate_with(
        config: &BackoffCalculatorConfig,
        context: &BackoffContext,
        now: DateTime<Utc>,
    ) -> BackoffResult {
        let (delay_ms, backoff_type) = match context.retry_after {
            Some(requested) => {
                let requested_ms = u64::try_from(requested.as_millis()).unwrap_or(u64::MAX);
                (requested_ms.min(config.max_delay_ms), BackoffType::ServerRequested)
            }
            None => {
                let delay = Self::exponential_delay_ms(config, context.attempts);
                let delay = if config.jitter_enabled {
                    Self::apply_jitter(config, delay)
                } else {
                    delay
                };
                (delay, BackoffType::Exponential)
            }
        };

        let delay = Duration::from_millis(delay_ms);
        let next_retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        BackoffResult {
            delay,
            backoff_type,
            next_retry_at,
        }
    }

    /// `base * multiplier^(attempts - 1)` capped at the maximum
    fn exponential_delay_ms(config: &BackoffCalculatorConfig, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = config.base_delay_ms as f64 * config.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= config.max_delay_ms as f64 {
            config.max_delay_ms
        } else {
            raw as u64
        }
    }

    fn apply_jitter(config: &BackoffCalculatorConfig, delay_ms: u64) -> u64 {
        let jitter_range = (delay_ms as f64 * config.max_jitter) as u64;
        if jitter_range == 0 {
            return delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=jitter_range);
        let jittered = if rng.gen_bool(0.5) {
            delay_ms.saturating_add(jitter)
        } else {
            delay_ms.saturating_sub(jitter)
        };
        jittered.min(config.max_delay_ms)
    }
}
