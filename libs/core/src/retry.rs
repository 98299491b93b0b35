use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.attempts()
    }
}

/// Runs `op` until it succeeds, the error is not retryable, or the budget is spent.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, Fut, Op, R>(
    policy: RetryPolicy,
    is_retryable: R,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if policy.is_last(attempt) || !is_retryable(&err) {
                    return Err(err);
                }
                warn!(attempt, error = %err, delay_ms = policy.delay.as_millis() as u64, "retrying operation");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
