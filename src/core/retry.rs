//! Bounded retry with exponential backoff around a single backend call

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::BackendError;

/// Run `operation` up to `max_attempts` times, sleeping
/// `base_delay * 2^(attempt-1)` between attempts.
///
/// Non-retryable errors (missing sensor, rejection) return immediately.
/// On exhaustion the last error is returned; the caller decides what a
/// failed cycle means.
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    base_delay: Duration,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt >= max_attempts => return Err(err),
            Err(err) => {
                let delay = backoff_delay(base_delay, attempt);
                debug!(attempt, max_attempts, ?delay, "retrying after: {}", err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Delay before attempt `attempt + 1`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}
