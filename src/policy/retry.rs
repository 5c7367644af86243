//! Retry Policy
//!
//! Decides, from the failures a step has seen so far in a run, whether to
//! try again (and after how long) or give up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// Per-step retry configuration.
///
/// Backoff grows exponentially from `initial_backoff_ms` by `multiplier`
/// per failed attempt and is capped at `max_backoff_ms`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Scale each delay by a random factor in [0.8, 1.2].
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp(StepError),
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the `failures`-th failed attempt (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);

        let ms = if self.jitter {
            capped * (0.8 + rand::random::<f64>() * 0.4)
        } else {
            capped
        };

        Duration::from_millis(ms as u64)
    }

    /// Decides what to do given every failure observed for the step so far.
    ///
    /// Unreachable and remote failures consume the budget identically. A
    /// circuit rejection is never retried.
    pub fn decide(&self, failures: &[StepError]) -> RetryDecision {
        let Some(last) = failures.last() else {
            return RetryDecision::Retry(Duration::ZERO);
        };

        if matches!(last, StepError::CircuitOpen { .. }) {
            return RetryDecision::GiveUp(last.clone());
        }

        let attempts = failures.len() as u32;
        if attempts >= self.max_attempts.max(1) {
            return RetryDecision::GiveUp(last.clone());
        }

        RetryDecision::Retry(self.backoff(attempts))
    }
}
