use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// A wrapper around a future that implements timing-out of that future.
pub struct TimeoutFuture<F: Future> {
    fut: F,
    timeout: Duration,
}

impl<F: Future> TimeoutFuture<F> {
    pub fn new(fut: F, timeout: Duration) -> Self {
        Self { fut, timeout }
    }

    /// Waits for the future to complete, or errors with [TimedOut] if the timeout elapses first.
    /// The inner future is dropped on timeout.
    ///
    /// **Not** cancel-safe.
    pub async fn wait(self) -> Result<F::Output, TimedOut> {
        let timeout = self.timeout;
        tokio::select! {
            r = self.fut => Ok(r),
            _ = tokio::time::sleep(timeout) => Err(TimedOut(timeout)),
        }
    }
}
