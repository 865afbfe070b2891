// ===============================
// src/retry.rs
// ===============================
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::metrics::PORT_RETRIES;
use crate::port::PortError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at `max_delay`, plus up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let base = self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay);
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. `idempotent` decides whether `Timeout` is retried.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, idempotent: bool, mut f: F) -> Result<T, PortError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PortError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if !e.is_retryable(idempotent) || attempt >= policy.max_attempts.max(1) {
                    return Err(e);
                }
                let delay = policy.backoff(attempt - 1);
                warn!(op, attempt, ?delay, err = %e, "retrying");
                PORT_RETRIES.with_label_values(&[op]).inc();
                sleep(delay).await;
            }
        }
    }
}
