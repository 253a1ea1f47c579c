//! Retry decisions for failed batches.
//!
//! A failed send is either retried after a capped exponential backoff or
//! turned into a terminal [`DeliveryError`]. The decision depends only on
//! the error kind and the attempt number, so it can be tested without a
//! transport.

use crate::error::{DeliveryError, TransportError};
use rand::Rng;
use std::time::Duration;

/// Bounds for retrying transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Upper bound on any delay, before jitter.
    pub backoff_max: Duration,
    /// Random spread applied to each delay, as a fraction of it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Highest attempt number a batch may reach.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retrying after `attempt` failed, without jitter.
    ///
    /// Doubles from `backoff_base` and saturates at `backoff_max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// What to do with a batch whose send just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Send again after `delay`.
    Retry { delay: Duration },
    /// Give up; every record in the batch resolves with this error.
    Terminal(DeliveryError),
}

/// Classifies failures and computes backoff.
#[derive(Debug, Clone)]
pub struct RetryGovernor {
    policy: RetryPolicy,
}

impl RetryGovernor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the fate of a batch whose `attempt`-th send failed with `error`.
    pub fn decide(&self, error: &TransportError, attempt: u32) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Terminal(DeliveryError::Fatal(error.clone()));
        }

        if attempt >= self.policy.max_attempts() {
            return RetryDecision::Terminal(DeliveryError::RetriesExhausted {
                attempts: attempt,
                last_error: error.clone(),
            });
        }

        RetryDecision::Retry {
            delay: self.delay(attempt),
        }
    }

    /// Backoff for the retry following `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}
