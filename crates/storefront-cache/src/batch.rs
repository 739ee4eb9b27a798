use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::{Namespace, NamespacePolicy};
use crate::context::NamespaceFront;
use crate::error::FetchResult;
use crate::executor;
use crate::flight::FlightTracker;
use crate::key::CacheKey;
use crate::snapshot::SnapshotHandle;
use crate::store::{CacheEntry, CacheStore};

/// A multi-item lookup against a batched namespace.
///
/// List views (cart, listing pages) need data for dozens of items at
/// once; one request per item would be slow and would defeat coalescing
/// under rapid re-renders. Implementors wrap the batched REST call and
/// derive per-item keys so batch results also serve later single-item
/// lookups.
pub trait BatchRequest: Clone + Send + Sync + 'static {
    /// Identifier of one item within the batch (product id, variant
    /// id, ...). The `Ord` bound is what normalizes batch coalescing
    /// keys; `Display` is how an id is written into them.
    type Id: Clone + Eq + Ord + Hash + fmt::Display + Send + Sync + 'static;

    /// The cached per-item value type.
    type Item: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Derives the cache key for one item.
    fn item_key(&self, id: &Self::Id) -> CacheKey;

    /// Fetches the given items in one underlying call.
    ///
    /// Ids absent from the returned map are treated as unknown and
    /// silently omitted from results, never as errors.
    fn fetch_batch(
        &self,
        ids: Vec<Self::Id>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, FetchResult<HashMap<Self::Id, Self::Item>>>;
}

struct BatchCacheInner<R: BatchRequest> {
    policy: NamespacePolicy,
    store: CacheStore<R::Item>,
    flights: FlightTracker<HashMap<R::Id, R::Item>>,
    snapshots: SnapshotHandle,
}

/// Cached, coalesced access to one batched namespace.
pub struct BatchCache<R: BatchRequest> {
    inner: Arc<BatchCacheInner<R>>,
}

impl<R: BatchRequest> Clone for BatchCache<R> {
    fn clone(&self) -> Self {
        BatchCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BatchRequest> std::fmt::Debug for BatchCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCache")
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<R: BatchRequest> BatchCache<R> {
    pub(crate) fn new(
        namespace: Namespace,
        policy: NamespacePolicy,
        snapshots: SnapshotHandle,
    ) -> Self {
        BatchCache {
            inner: Arc::new(BatchCacheInner {
                policy,
                store: CacheStore::new(namespace, policy),
                flights: FlightTracker::new(),
                snapshots,
            }),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.store.namespace()
    }

    /// Returns the values for `ids`, fetching only the cache misses.
    ///
    /// Ids with a fresh entry are served from the store; the rest are
    /// fetched in exactly one batched call, keyed by the sorted,
    /// deduplicated miss set so that overlapping batch requests coalesce
    /// onto the same pending operation. Fetched items are stored
    /// individually before the merged result is returned.
    ///
    /// An id the underlying call did not answer is absent from the
    /// result: it means "unknown", not "missing from the catalog", and it
    /// is not an error.
    pub async fn get_batch(
        &self,
        request: R,
        ids: &[R::Id],
    ) -> FetchResult<HashMap<R::Id, R::Item>> {
        let mut resolved = HashMap::with_capacity(ids.len());
        let mut misses = BTreeSet::new();
        for id in ids {
            match self.inner.store.fresh_value(&request.item_key(id)) {
                Some(value) => {
                    resolved.insert(id.clone(), value);
                }
                None => {
                    misses.insert(id.clone());
                }
            }
        }

        if misses.is_empty() {
            tracing::trace!(
                namespace = %self.namespace(),
                count = resolved.len(),
                "batch served entirely from cache"
            );
            return Ok(resolved);
        }

        let batch_key = CacheKey::for_batch(self.namespace(), misses.iter());
        let inner = Arc::clone(&self.inner);
        let fetched = self
            .inner
            .flights
            .resolve(batch_key, move |cancel| async move {
                let ids: Vec<R::Id> = misses.into_iter().collect();
                let items = executor::execute(&inner.policy, &cancel, || {
                    request.fetch_batch(ids.clone(), cancel.clone())
                })
                .await?;

                for (id, item) in &items {
                    inner.store.put(request.item_key(id), item.clone());
                }
                inner.snapshots.schedule_save(&inner.store);
                Ok(items)
            })
            .await?;

        resolved.extend(fetched);
        Ok(resolved)
    }

    /// Cancels the pending batched lookup for exactly this id set (after
    /// sorting and deduplication), if one is in flight.
    pub fn cancel(&self, ids: &[R::Id]) {
        let ids: BTreeSet<&R::Id> = ids.iter().collect();
        self.inner
            .flights
            .cancel(&CacheKey::for_batch(self.namespace(), ids));
    }

    /// Cancels every pending batched lookup in this namespace.
    pub fn cancel_all(&self) {
        self.inner.flights.cancel_all();
    }

    /// Drops the entry for one item.
    pub fn evict(&self, request: &R, id: &R::Id) {
        self.inner.store.evict(&request.item_key(id));
        self.inner.snapshots.schedule_save(&self.inner.store);
    }

    /// Drops every entry in this namespace, durable record included.
    pub fn evict_all(&self) {
        self.inner.store.evict_all();
        self.inner.snapshots.schedule_remove(self.namespace());
    }

    pub(crate) fn hydrate(&self, rows: Vec<(CacheKey, CacheEntry<R::Item>)>) {
        for (key, entry) in rows {
            self.inner.store.insert_entry(key, entry);
        }
    }
}

impl<R: BatchRequest> NamespaceFront for BatchCache<R> {
    fn namespace(&self) -> Namespace {
        BatchCache::namespace(self)
    }

    fn evict_all(&self) {
        BatchCache::evict_all(self);
    }
}
