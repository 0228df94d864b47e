//! Retry policy and the backoff executor.
//!
//! Policies resolve with operation > collection > database precedence;
//! `Disabled` at any level stops inheritance below it. The default
//! classifier retries busy/locked driver codes, connection failures, and
//! transient transaction failures; validation, constraint, and `Aborted`
//! failures are never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use doclite_core::error::{DbError, Result};

use crate::cancel::CancelToken;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retry attempts allotted to one logical operation.
    pub budget: u32,
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Randomize delays to spread contention.
    pub jitter: bool,
    /// Cumulative wall-clock cap over all attempts.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 5,
            min_delay_ms: 10,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter: true,
            max_elapsed_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.min_delay_ms as f64 * self.factor.powi(exponent as i32);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0) as u64;
        let delay = if self.jitter && capped > 1 {
            // Equal jitter: half fixed, half random.
            let half = capped / 2;
            half + rand::thread_rng().gen_range(0..=half)
        } else {
            capped
        };
        Duration::from_millis(delay)
    }
}

/// How retries are configured at one precedence level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetrySetting {
    /// No retries at this level or below.
    Disabled,
    /// Retry with the given policy.
    Policy(RetryPolicy),
}

impl Default for RetrySetting {
    fn default() -> Self {
        Self::Policy(RetryPolicy::default())
    }
}

impl RetrySetting {
    /// The policy to run with, or `None` when disabled.
    pub fn policy(&self) -> Option<&RetryPolicy> {
        match self {
            Self::Disabled => None,
            Self::Policy(policy) => Some(policy),
        }
    }
}

/// Context handed to the retry hooks on each failed attempt.
pub struct RetryContext<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// The failure.
    pub error: &'a DbError,
    /// Wall-clock time since the operation started.
    pub elapsed: Duration,
}

/// Optional observation and classification hooks.
#[derive(Clone, Default)]
pub struct RetryHooks {
    /// Called after every failed attempt that will be retried.
    pub on_failed_attempt: Option<Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>>,
    /// Overrides the retryability classification.
    pub should_retry: Option<Arc<dyn Fn(&RetryContext<'_>) -> bool + Send + Sync>>,
    /// Decides whether a failure consumes budget (rate-limit style failures
    /// can be excluded).
    pub should_consume_budget: Option<Arc<dyn Fn(&RetryContext<'_>) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHooks")
            .field("on_failed_attempt", &self.on_failed_attempt.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .field("should_consume_budget", &self.should_consume_budget.is_some())
            .finish()
    }
}

/// Runs `f`, retrying transient failures within the policy's budget and
/// wall-clock cap. Cancellation preempts both the attempts and the backoff
/// sleeps; `Aborted` is never retried.
pub(crate) fn run_with_retry<R>(
    policy: Option<&RetryPolicy>,
    hooks: &RetryHooks,
    signal: Option<&CancelToken>,
    op: &'static str,
    mut f: impl FnMut() -> Result<R>,
) -> Result<R> {
    let start = Instant::now();
    let mut consumed: u32 = 0;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let error = match f() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(policy) = policy else {
            return Err(error);
        };
        if error.is_aborted() {
            return Err(error);
        }
        let ctx = RetryContext {
            attempt,
            error: &error,
            elapsed: start.elapsed(),
        };
        let retryable = match &hooks.should_retry {
            Some(hook) => hook(&ctx),
            None => error.is_retryable(),
        };
        if !retryable {
            return Err(error);
        }
        let consume = match &hooks.should_consume_budget {
            Some(hook) => hook(&ctx),
            None => true,
        };
        if consume {
            consumed += 1;
            if consumed > policy.budget {
                return Err(error);
            }
        }
        if let Some(cap) = policy.max_elapsed_ms {
            if start.elapsed() >= Duration::from_millis(cap) {
                return Err(error);
            }
        }
        if let Some(hook) = &hooks.on_failed_attempt {
            hook(&ctx);
        }
        debug!(op, attempt, error = %error, "retrying transient failure");
        let delay = policy.delay_for_attempt(consumed.max(1));
        match signal {
            Some(token) => {
                if let Some(aborted) = token.sleep(delay) {
                    return Err(aborted);
                }
            }
            None => std::thread::sleep(delay),
        }
    }
}
