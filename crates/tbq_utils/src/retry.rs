use std::future::Future;

use crate::decay::ExpDecay;

/// Runs `operation` until it succeeds, fails with an error `should_retry` rejects, or
/// `max_attempts` attempts were made. Waits out the next step of `backoff` between attempts.
///
/// The operation is handed the 1-indexed attempt number.
pub async fn retry_with_backoff<O, F, R, E>(
    max_attempts: usize,
    mut backoff: ExpDecay,
    should_retry: impl Fn(&E) -> bool,
    mut operation: O,
) -> Result<R, E>
where
    O: FnMut(usize) -> F,
    F: Future<Output = Result<R, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let wait = backoff.next_duration();
        tracing::debug!(attempt, max_attempts, ?wait, %error, "retrying failed operation");
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}
