//! Retry policy: pure mapping from (attempt count, error class) to a
//! retry-after duration or a give-up decision.
//!
//! Polling uses the jittered backoff path; the realtime channel uses the
//! deterministic [`reconnect_delay`] sequence so reconnect timing stays
//! non-decreasing and capped.

use crate::errors::ErrorClass;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts before giving up.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// State tracking for retry operations.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Current attempt number (0-indexed).
    pub attempt: usize,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the state after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns true if retries are exhausted.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_attempts
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts remain, give up.
    GiveUp,
    /// The error class is not retryable.
    NotRetryable,
}

/// The undecorated backoff delay for an attempt, capped at the maximum.
fn backoff_delay(attempt: usize, config: &RetryConfig) -> u64 {
    let base = config.base_delay_ms;
    let max = config.max_delay_ms;
    match config.backoff_strategy {
        BackoffStrategy::Exponential => {
            let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
            base.saturating_mul(2u64.saturating_pow(exp)).min(max)
        }
        BackoffStrategy::Linear => base.saturating_mul(attempt as u64 + 1).min(max),
        BackoffStrategy::Constant => base.min(max),
    }
}

fn apply_jitter(delay: u64, strategy: JitterStrategy) -> u64 {
    match strategy {
        JitterStrategy::None => delay,
        JitterStrategy::Full => {
            if delay == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=delay)
            }
        }
        JitterStrategy::Equal => {
            let half = delay / 2;
            if half == 0 {
                delay
            } else {
                half + rand::thread_rng().gen_range(0..=half)
            }
        }
    }
}

/// Makes a retry decision for an error of the given class.
///
/// Transient transport errors retry with backoff until `max_attempts`
/// total attempts have failed; permanent failures and protocol violations
/// are never retried. The failed attempt is counted before the decision,
/// so an attempt cap of 3 means the third consecutive failure gives up.
#[must_use]
pub fn decide(
    state: &mut RetryState,
    config: &RetryConfig,
    class: ErrorClass,
) -> RetryDecision {
    match class {
        ErrorClass::TransientTransport => {
            let failed_attempt = state.attempt;
            state.attempt += 1;
            if state.is_exhausted(config) {
                return RetryDecision::GiveUp;
            }
            let delay = apply_jitter(
                backoff_delay(failed_attempt, config),
                config.jitter_strategy,
            );
            RetryDecision::Retry(Duration::from_millis(delay))
        }
        ErrorClass::RemotePermanentFailure
        | ErrorClass::ProtocolViolation
        | ErrorClass::ExhaustedRetries => RetryDecision::NotRetryable,
    }
}

/// The deterministic reconnect delay: `min(base * 2^attempt, cap)`.
///
/// No jitter is applied, so the sequence is non-decreasing and never
/// exceeds the configured cap.
#[must_use]
pub fn reconnect_delay(attempt: usize, config: &RetryConfig) -> Duration {
    let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
    let delay = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(exp))
        .min(config.max_delay_ms);
    Duration::from_millis(delay)
}
