//! Caller-side retry loop.
//!
//! Nothing in the pool retries on its own. Callers that want to retry an
//! `invoke`, which re-acquires and therefore redials, wrap it in [`retry`], or
//! in [`retry_if`] to give up at once on errors that another attempt cannot
//! fix (see [`Error::is_transient`](crate::Error::is_transient)).

use core::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero means the default.
    pub attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryConfig {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("retry was cancelled")]
    Cancelled,

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The error was not worth retrying.
    #[error("attempt {attempt} failed permanently: {error}")]
    Permanent { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// The error of the final attempt, `None` if the loop was cancelled.
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Cancelled => None,
            Self::Exhausted { last, .. } => Some(last),
            Self::Permanent { error, .. } => Some(error),
        }
    }
}

/// Runs `op` until it succeeds, `config.attempts` are used up, or `cancel`
/// fires. Every error is retried.
///
/// Cancellation aborts both an attempt in flight and the pause between
/// attempts. There is no pause after the last attempt.
///
/// # Errors
///
/// - [`RetryError::Cancelled`] once `cancel` fires.
/// - [`RetryError::Exhausted`] with the last error when every attempt failed.
pub async fn retry<T, E, F, Fut>(
    config: RetryConfig,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: core::fmt::Display,
{
    retry_if(config, cancel, |_: &E| true, op).await
}

/// Like [`retry`], but stops at the first error `retryable` rejects.
///
/// # Errors
///
/// As [`retry`], plus [`RetryError::Permanent`] carrying the rejected error.
pub async fn retry_if<T, E, P, F, Fut>(
    config: RetryConfig,
    cancel: &CancellationToken,
    mut retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    P: FnMut(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: core::fmt::Display,
{
    let attempts = if config.attempts == 0 {
        DEFAULT_ATTEMPTS
    } else {
        config.attempts
    };

    let mut attempt = 1;
    loop {
        let err = match cancel.run_until_cancelled(op()).await {
            None => return Err(RetryError::Cancelled),
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) => err,
        };

        if !retryable(&err) {
            return Err(RetryError::Permanent {
                attempt,
                error: err,
            });
        }
        if attempt >= attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, delay = ?config.delay, "Attempt failed, retrying: {}", err);

        if cancel
            .run_until_cancelled(tokio::time::sleep(config.delay))
            .await
            .is_none()
        {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;
    }
}
