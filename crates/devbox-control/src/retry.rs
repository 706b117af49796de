//! One-shot retry for lock contention.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Pause before retrying an operation that found its entity busy.
pub const BUSY_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Run `op`, and run it once more after `backoff` if it failed with a
/// retriable error. The second result is returned as is.
///
/// Only `Busy` raised before any collaborator acted is retriable, so the
/// second run never repeats a provisioner or tunnel action.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry_busy<T, F, Fut>(backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(err) if err.is_retriable() => {
            debug!(error = %err, backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX), "Busy, retrying once");
            tokio::time::sleep(backoff).await;
            op().await
        }
        result => result,
    }
}
