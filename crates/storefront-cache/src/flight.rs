use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, FetchResult};
use crate::key::CacheKey;

/// A lookup in progress.
///
/// Owned by the tracker for its lifetime; removed unconditionally when the
/// lookup settles, no matter how many callers joined it. Callers only ever
/// hold a clone of the shared result future.
struct Flight<V: Clone> {
    result: Shared<BoxFuture<'static, FetchResult<V>>>,
    cancel: CancellationToken,
}

/// Removes a flight from the tracker once the lookup settles, whether by
/// returning or by panicking.
struct RemoveOnSettle<V: Clone> {
    flights: Arc<Mutex<HashMap<CacheKey, Flight<V>>>>,
    key: CacheKey,
}

impl<V: Clone> Drop for RemoveOnSettle<V> {
    fn drop(&mut self) {
        self.flights
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// The coalescing registry ("single-flight").
///
/// Guarantees that for any key at most one underlying lookup is
/// outstanding at a time. Concurrent callers for the same key attach to
/// the pending flight and settle together: they all succeed together, all
/// fail together, or all observe cancellation together.
///
/// The check-then-create sequence is guarded by the mutex, so the
/// guarantee holds under real parallelism, not just under cooperative
/// interleaving.
pub(crate) struct FlightTracker<V: Clone> {
    flights: Arc<Mutex<HashMap<CacheKey, Flight<V>>>>,
}

impl<V> FlightTracker<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        FlightTracker {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the pending lookup for `key`, or starts one via `make_fetch`.
    ///
    /// A new flight runs as a detached task, so it settles even when every
    /// caller stops polling. On settlement the flight removes itself from
    /// the tracker *before* the outcome becomes observable; a caller that
    /// reacts to the outcome by issuing another lookup therefore always
    /// starts a fresh flight instead of racing the teardown.
    pub(crate) async fn resolve<F>(
        &self,
        key: CacheKey,
        make_fetch: impl FnOnce(CancellationToken) -> F,
    ) -> FetchResult<V>
    where
        F: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let result = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(&key) {
                Some(flight) => flight.result.clone(),
                None => {
                    let cancel = CancellationToken::new();
                    let fetch = make_fetch(cancel.clone());

                    let settled = RemoveOnSettle {
                        flights: Arc::clone(&self.flights),
                        key: key.clone(),
                    };
                    let task = tokio::spawn(async move {
                        let _settled = settled;
                        fetch.await
                    });

                    let result = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(FetchError::Permanent(format!("lookup task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();

                    flights.insert(key, Flight {
                        result: result.clone(),
                        cancel,
                    });
                    result
                }
            }
        };

        result.await
    }

    /// Cancels the pending lookup for `key`, if any.
    ///
    /// Cancellation is cooperative: the flight's token is tripped, the
    /// executor stops before its next attempt, and every attached caller
    /// resolves with [`FetchError::Cancelled`].
    pub(crate) fn cancel(&self, key: &CacheKey) {
        if let Some(flight) = self.flights.lock().unwrap().get(key) {
            flight.cancel.cancel();
        }
    }

    /// Cancels every pending lookup in this tracker.
    pub(crate) fn cancel_all(&self) {
        for flight in self.flights.lock().unwrap().values() {
            flight.cancel.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flights.lock().unwrap().len()
    }
}
