use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::config::NamespacePolicy;
use crate::error::{FetchError, FetchResult};

/// Runs a caller-supplied lookup with bounded retry and cooperative
/// cancellation.
///
/// `task_gen` is invoked once per attempt. Only
/// [`Transient`](FetchError::Transient) failures are retried, up to
/// `policy.max_retries` total attempts, with a linear backoff of
/// `attempt * policy.backoff` between attempts. Once the budget is spent
/// the failure is re-classified as [`Permanent`](FetchError::Permanent).
///
/// [`AuthRequired`](FetchError::AuthRequired) and
/// [`Cancelled`](FetchError::Cancelled) short-circuit immediately.
///
/// Cancellation is checked before every attempt and raced against both
/// the attempt itself and the backoff sleep. A transport that cannot be
/// aborted simply loses the race; its eventual result is discarded along
/// with the dropped future.
pub async fn execute<G, F, T>(
    policy: &NamespacePolicy,
    cancel: &CancellationToken,
    task_gen: G,
) -> FetchResult<T>
where
    G: Fn() -> F,
    F: Future<Output = FetchResult<T>>,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = task_gen() => outcome,
        };

        match outcome {
            Err(err @ FetchError::Transient(_)) => {
                if attempt >= max_attempts {
                    tracing::debug!(attempts = attempt, error = %err, "retry budget spent");
                    return Err(err.into_terminal());
                }

                let delay = policy.backoff * attempt as u32;
                tracing::trace!(attempt, ?delay, "retrying transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}
