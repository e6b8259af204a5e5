//! Shared throttle for concurrent model calls.
//!
//! One `ModelBudget` is created per build and handed to every worker. It caps
//! in-flight calls with a semaphore and, optionally, the request rate with a
//! token bucket. Excess work waits for a permit instead of firing.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::LlmError;

/// Concurrency permits plus an optional requests-per-second limiter.
#[derive(Clone)]
pub struct ModelBudget {
    permits: Arc<Semaphore>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    concurrency: usize,
}

impl std::fmt::Debug for ModelBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBudget")
            .field("concurrency", &self.concurrency)
            .field("available", &self.permits.available_permits())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl ModelBudget {
    /// Create a budget allowing `concurrency` simultaneous calls and at most
    /// `requests_per_second` call starts per second (unbounded when `None`).
    pub fn new(concurrency: usize, requests_per_second: Option<u32>) -> Self {
        let concurrency = concurrency.max(1);
        let limiter = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            limiter,
            concurrency,
        }
    }

    /// Wait for a call slot. The returned permit must be held for the
    /// duration of the call.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, LlmError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| LlmError::Transport(format!("model budget closed: {e}")))?;
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        Ok(permit)
    }

    /// Maximum simultaneous calls.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
