//! Bounded exponential backoff on the async clock

use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry bounds for one logical operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

/// Delay before retry number `attempt` (0-based): base doubling each
/// attempt, capped at the policy maximum
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.min(20);
    let delay = policy.base_delay.saturating_mul(1u32 << exp);
    delay.min(policy.max_delay)
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts
/// while the failure is classified retryable. Non-retryable failures and
/// the final attempt's failure are returned as-is.
pub async fn retry_with_backoff<F, Fut, T>(
    mut op: F,
    policy: &RetryPolicy,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.retryable || attempt >= policy.max_attempts {
                    return Err(err);
                }
                // Prefer the error's own base delay when it advertises one
                let base = err.retry_after.unwrap_or(policy.base_delay);
                let delay = backoff_delay(
                    &RetryPolicy {
                        base_delay: base,
                        ..policy.clone()
                    },
                    attempt - 1,
                );
                warn!(
                    operation = %err.operation,
                    code = %err.code,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
