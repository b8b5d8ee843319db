//! Classified retry with exponential backoff.
//!
//! [`BackoffExecutor`] wraps every call that leaves the process (page fetches,
//! enrichment steps, sink writes, checkpoint commits). Only
//! [`ErrorClass::Transient`](crate::traits::ErrorClass) failures are retried;
//! everything else is returned on first sight.
//!
//! The wrapped operation may run several times, so it must be safe to re-run.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::traits::HarvestError;

/// Retry configuration attached to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, before jitter.
    pub base_delay_ms: u64,
    /// Growth factor applied per further attempt.
    pub backoff_factor: f64,
    /// Uniform jitter added to every delay.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 3_000,
            backoff_factor: 2.0,
            jitter_min_ms: 1_000,
            jitter_max_ms: 3_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps. Useful for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
        }
    }

    /// Delay before attempt `attempt` (1-based), jitter excluded.
    ///
    /// The first attempt never waits; attempt `k >= 2` waits
    /// `base_delay * backoff_factor^(k-2)`.
    pub fn base_delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let ms = (self.base_delay_ms as f64 * factor).min(u64::MAX as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay before attempt `attempt` with a freshly sampled jitter.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        self.base_delay_before(attempt) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let (min, max) = (self.jitter_min_ms, self.jitter_max_ms.max(self.jitter_min_ms));
        if max == min {
            return Duration::from_millis(min);
        }
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            return Duration::from_millis(min);
        }
        let span = (max - min).saturating_add(1);
        Duration::from_millis(min + u64::from_le_bytes(bytes) % span)
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffExecutor {
    policy: RetryPolicy,
}

impl BackoffExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails non-transiently, or the
    /// policy's attempts are used up.
    ///
    /// # Errors
    ///
    /// - Terminal, defect and already-exhausted errors are returned unchanged
    ///   after a single attempt.
    /// - A transient error surviving every attempt is wrapped in
    ///   [`HarvestError::RetriesExhausted`].
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = label, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(operation = label, attempt, error = %err, "Not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(operation = label, attempts = attempt, error = %err, "Retries exhausted");
                return Err(HarvestError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            attempt += 1;
            let delay = self.policy.delay_before(attempt);
            warn!(
                operation = label,
                next_attempt = attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
