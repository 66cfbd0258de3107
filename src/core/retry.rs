//! Bounded retry with exponential backoff.
//!
//! Only GET and HEAD are ever retried. Every attempt outcome is recorded into the
//! service's breaker before the loop decides anything else, so the breaker sees the
//! attempt-level failure rate.
use std::{future::Future, time::Duration};

use hyper::Method;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RetryConfig,
    core::{
        circuit_breaker::{CircuitBreaker, CircuitState},
        classifier::AttemptOutcome,
    },
};

/// Methods that are safe to send more than once.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Attempt budget for a request method.
    pub fn attempts_for(&self, method: &Method) -> u32 {
        if is_idempotent(method) {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay between attempt `attempt` and the next one: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter_ratio > 0.0 {
            let jitter = rand::rng().random_range(0.0..=self.jitter_ratio);
            delay + delay.mul_f64(jitter)
        } else {
            delay
        }
    }
}

/// What the retry loop ended with.
#[derive(Debug)]
pub struct RetryReport {
    /// Outcome of the last attempt made.
    pub outcome: AttemptOutcome,
    pub attempts: u32,
    /// The caller went away before the budget was used up.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` up to the method's budget.
    ///
    /// `attempt(k)` performs the k-th (1-based) call and returns its classified outcome.
    /// The loop stops on success, on a non-retryable failure, when the budget is spent,
    /// when the breaker has opened, or when `cancel` fires during a backoff.
    pub async fn run<F, Fut>(
        &self,
        method: &Method,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> RetryReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let budget = self.policy.attempts_for(method);
        let mut current = 1;

        loop {
            let outcome = attempt(current).await;
            let classification = outcome.classification();
            breaker.record(classification);
            crate::metrics::increment_upstream_attempts(breaker.service(), classification);

            if !classification.is_retryable() || current >= budget {
                return RetryReport {
                    outcome,
                    attempts: current,
                    cancelled: false,
                };
            }

            if breaker.state() == CircuitState::Open {
                tracing::debug!(
                    service = breaker.service(),
                    attempts = current,
                    "breaker opened mid-request, abandoning retries"
                );
                return RetryReport {
                    outcome,
                    attempts: current,
                    cancelled: false,
                };
            }

            let delay = self.policy.backoff(current);
            tracing::debug!(
                service = breaker.service(),
                attempt = current,
                delay_ms = delay.as_millis() as u64,
                "retrying upstream call"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(service = breaker.service(), attempts = current, "caller went away, retries abandoned");
                    return RetryReport {
                        outcome,
                        attempts: current,
                        cancelled: true,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }

            current += 1;
        }
    }
}
