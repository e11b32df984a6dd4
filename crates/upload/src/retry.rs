//! Cancellation-aware retry loop shared by precheck, chunk uploads and merge.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{ServiceError, UploadError};

/// Failure of a single attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Worth another attempt.
    Transient(String),
    /// Stops the loop right away.
    Fatal(UploadError),
    /// The attempt observed cancellation.
    Aborted,
}

impl From<ServiceError> for AttemptError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Network(reason) => Self::Transient(reason),
            ServiceError::Aborted => Self::Aborted,
        }
    }
}

/// Why the loop gave up.
#[derive(Debug)]
pub(crate) enum RetryError {
    Exhausted { attempts: u32, reason: String },
    Fatal(UploadError),
    Aborted,
}

/// Runs `op` until it succeeds, fails fatally, runs out of attempts, or
/// `cancel` fires. `op` receives the 1-based attempt number; `on_retry` is
/// told about every failed attempt that will be retried.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32, &str),
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Aborted);
        }

        let reason = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(_) if cancel.is_cancelled() => return Err(RetryError::Aborted),
            Err(AttemptError::Aborted) => return Err(RetryError::Aborted),
            Err(AttemptError::Fatal(e)) => return Err(RetryError::Fatal(e)),
            Err(AttemptError::Transient(reason)) => reason,
        };

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                reason,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(attempt, max_attempts, ?delay, error = %reason, "attempt failed, retrying");
        on_retry(attempt, &reason);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Aborted),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
