use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation aborted")]
pub struct Aborted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is spent,
/// doubling the delay between attempts. The last error is returned as is.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Aborted> + std::fmt::Display,
{
    retry_if(policy, cancel, |_| true, operation).await
}

/// Like [`retry`], but errors rejected by `retryable` are returned at once.
pub async fn retry_if<T, E, P, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<Aborted> + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(Aborted.into());
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Aborted.into()),
            result = operation(attempt) => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retryable(&err) {
            debug!(event = "retry_skipped", attempt, error = %err);
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(event = "retry_exhausted", attempts = attempt, error = %err);
            return Err(err);
        }
        debug!(
            event = "retry_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Aborted.into()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = delay.saturating_mul(2);
        attempt += 1;
    }
}
