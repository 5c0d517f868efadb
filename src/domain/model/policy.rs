//! Serializable policy values attached to step declarations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StepError;

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Constant `delay` between attempts.
    #[default]
    None,
    /// `delay * n` before the n-th retry.
    Linear,
    /// `delay * 2^(n-1)` before the n-th retry.
    Exponential,
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based), uncapped.
    pub fn delay(&self, base: Duration, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self {
            Backoff::None => base,
            Backoff::Linear => base.saturating_mul(retry),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                base.saturating_mul(factor)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Adds up to 10% random delay on top of the computed backoff.
    #[serde(default)]
    pub jitter: bool,
    /// Error kinds eligible for retry. Empty means every non-terminal error.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
            delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff, delay: Duration) -> Self {
        self.backoff = backoff;
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        let mut delay = self.backoff.delay(base, retry);
        if self.jitter && !delay.is_zero() {
            delay += delay.mul_f64(rand::random::<f64>() * 0.1);
        }
        delay.min(Duration::from_millis(self.max_delay_ms))
    }

    pub fn should_retry(&self, error: &StepError) -> bool {
        if error.is_terminal() {
            return false;
        }
        self.retryable_errors.is_empty()
            || self.retryable_errors.iter().any(|k| k == error.kind())
    }
}

/// What a timed-out wait does next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Proceed to the next step.
    Continue,
    /// Abort the workflow.
    #[default]
    Fail,
    /// Mark exactly the next declared step as skipped.
    SkipNext,
    /// Hand the wait to `escalate_to` and restart the timeout window once.
    Escalate,
}

/// Token-bucket limit: at most `calls` acquisitions per `per_ms` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub calls: u32,
    pub per_ms: u64,
}

impl RateLimit {
    pub fn new(calls: u32, per: Duration) -> Self {
        Self {
            calls,
            per_ms: per.as_millis() as u64,
        }
    }

    pub fn per(&self) -> Duration {
        Duration::from_millis(self.per_ms)
    }
}
