//! Bounded exponential backoff for model calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::{LlmError, ModelBudget};

/// Retry ceiling and backoff shape for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so `max_retries + 1` calls at most).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// A call that did not succeed within the retry ceiling.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// Number of calls made.
    pub attempts: u32,
    /// Error returned by the last call.
    pub error: LlmError,
}

impl RetryPolicy {
    /// Policy without waiting between attempts, used by tests and offline runs.
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based), with up to 25% jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &LlmError) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        let mut delay = exp.min(self.max_delay);
        if let LlmError::RateLimited {
            retry_after: Some(after),
        } = error
        {
            delay = delay.max(*after).min(self.max_delay.max(*after));
        }
        if delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        delay.mul_f64(1.0 + jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry ceiling is reached. Each attempt holds one permit of `budget`;
    /// the permit is released while backing off.
    pub async fn run<T, F, Fut>(&self, budget: &ModelBudget, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match budget.acquire().await {
                Ok(_permit) => op(attempt).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(error) if error.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt, &error);
                    metrics::counter!("graphrag_llm_retries_total").increment(1);
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Model call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }
}
