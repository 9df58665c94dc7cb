use athanor_core::config::BackoffStrategy;
use athanor_core::error::{AthanorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Sleep for `delay` unless `token` fires first
pub(crate) async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(AthanorError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds, retrying transient errors forever
///
/// Non-transient errors are returned immediately. Each retry waits per
/// `backoff` and gives up with `Cancelled` once `token` fires.
pub(crate) async fn retry_transient<T, F, Fut>(
    operation: &str,
    backoff: &BackoffStrategy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff.calculate(attempt);
                warn!(operation, attempt, error = %e, ?delay, "Transient failure, retrying");
                attempt = attempt.saturating_add(1);
                sleep_or_cancel(delay, token).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
