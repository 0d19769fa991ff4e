//! Bounded exponential-backoff retry for idempotent remote calls.
//!
//! Used for provider health checks, runner invocations and idle
//! notifications. Destructive calls (node teardown) are never wrapped in
//! this helper.

use std::future::Future;
use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs exactly one attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// Returns the last error once attempts run out. `what` is only used in log
/// lines.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                tracing::warn!(what, attempt, error = %e, "Giving up after retries");
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off",
                );
            }
        }

        tokio::time::sleep(delay).await;
        delay = next_delay(delay, policy);
        attempt += 1;
    }
}
