//! Fixed-delay retry combinators.
//!
//! [`retry`] is bounded and used by the worker's history fetch;
//! [`retry_forever`] rides out transient errors in the client's status
//! polling.

use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Always at least 1.
    pub max_attempts: u32,
    /// Sleep between consecutive attempts (not after the last one).
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// All attempts failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy runs out.
///
/// `op` receives the 1-based attempt number. Every failure is logged at
/// `warn` with `label`.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "{label} failed",
                );
                if attempt >= policy.max_attempts {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
            }
        }
        tokio::time::sleep(policy.delay).await;
    }
}

/// Run `op` until it succeeds, sleeping `delay` after every failure.
///
/// Only ends through success or by the caller dropping the future.
pub async fn retry_forever<T, E, F, Fut>(delay: Duration, label: &str, mut op: F) -> T
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt).await {
            Ok(value) => return value,
            Err(e) => tracing::warn!(attempt, error = %e, "{label} failed; retrying"),
        }
        tokio::time::sleep(delay).await;
    }
}
