//! Bounded retry with exponential backoff and a hard per-attempt timeout.

use rand::Rng;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::jobs::{Job, JobContext};
use crate::models::ExecutionResult;

/// Upper bound of the random jitter, as a fraction of the delay
const MAX_JITTER: f64 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_multiplier: f64,
    pub timeout: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            rate_limit_multiplier: 4.0,
            timeout: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// `min(base * 2^(attempt-1), max)`; rate limits wait
    /// `rate_limit_multiplier` times longer and at least the upstream's
    /// retry-after hint. Every delay stays within `backoff_max`.
    pub fn backoff_for(&self, attempt: u32, error: &JobError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max);

        match error {
            JobError::RateLimited { retry_after, .. } => {
                let factor = self.rate_limit_multiplier.max(1.0);
                let scaled = Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
                    .unwrap_or(self.backoff_max);
                retry_after
                    .map_or(scaled, |hint| scaled.max(hint))
                    .min(self.backoff_max)
            }
            _ => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        (delay + delay.mul_f64(factor)).min(self.backoff_max.max(delay))
    }
}

/// Runs one job to a terminal result
#[derive(Debug, Clone, Default)]
pub struct RetryingExecutor {
    policy: RetryPolicy,
}

impl RetryingExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Never returns a non-terminal result. Cancellation during an attempt
    /// or a backoff sleep ends in `Skipped`.
    pub async fn execute(&self, job: &dyn Job, ctx: &JobContext) -> ExecutionResult {
        let name = job.name().to_string();
        let mut result = ExecutionResult::pending(&name);
        let max_attempts = self.policy.max_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                result.mark_skipped(&JobError::Cancelled);
                return result;
            }

            result.mark_running();
            result.attempts = attempt;
            let attempt_ctx = JobContext {
                attempt,
                ..ctx.clone()
            };

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(JobError::Cancelled),
                run = tokio::time::timeout(self.policy.timeout, job.run(&attempt_ctx)) => {
                    run.unwrap_or(Err(JobError::Timeout(self.policy.timeout)))
                }
            };

            let error = match outcome {
                Ok(output) => {
                    result.metadata.extend(output.metadata);
                    result.mark_success(output.rows_processed);
                    info!(
                        "✅ {} succeeded on attempt {} ({} rows)",
                        name, attempt, output.rows_processed
                    );
                    return result;
                }
                Err(JobError::Cancelled) => {
                    warn!("🛑 {} cancelled during attempt {}", name, attempt);
                    result.mark_skipped(&JobError::Cancelled);
                    return result;
                }
                Err(e) => e,
            };

            result
                .metadata
                .insert(format!("attempt_{}_error", attempt), error.to_string());

            if !error.is_retryable() || attempt == max_attempts {
                error!(
                    "❌ {} failed after {} attempt(s): {} ({})",
                    name,
                    attempt,
                    error,
                    error.kind()
                );
                result.mark_failed(&error);
                return result;
            }

            let delay = self.policy.jittered(self.policy.backoff_for(attempt, &error));
            warn!(
                "🔄 {} attempt {}/{} failed ({}), retrying in {:?}",
                name, attempt, max_attempts, error, delay
            );
            result.mark_pending();

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    warn!("🛑 {} cancelled while backing off", name);
                    result.mark_skipped(&JobError::Cancelled);
                    return result;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        result
    }
}
