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

/// One logical lookup against a single-item namespace.
///
/// Call sites implement this as a small struct wrapping their REST call:
/// the struct's fields are the lookup parameters, [`cache_key`] normalizes
/// them into a key, and [`fetch`] performs the actual request.
///
/// [`cache_key`]: Self::cache_key
/// [`fetch`]: Self::fetch
pub trait ItemRequest: Clone + Send + Sync + 'static {
    /// The cached value type.
    type Item: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Derives the cache key for this request.
    ///
    /// Must be deterministic and side-effect free: equal logical requests
    /// produce equal keys.
    fn cache_key(&self) -> CacheKey;

    /// Performs the underlying lookup.
    ///
    /// The token is tripped when the operation is cancelled; transports
    /// that support aborting should watch it. The executor additionally
    /// races the returned future against the token, so transports that
    /// cannot abort are simply dropped and their result discarded.
    fn fetch(&self, cancel: CancellationToken) -> BoxFuture<'static, FetchResult<Self::Item>>;
}

struct ItemCacheInner<T: Clone + Send + Sync + 'static> {
    policy: NamespacePolicy,
    store: CacheStore<T>,
    flights: FlightTracker<T>,
    snapshots: SnapshotHandle,
}

/// Cached, coalesced access to one single-item namespace.
///
/// Cloning is cheap and every clone shares the same store and pending
/// operations.
pub struct ItemCache<R: ItemRequest> {
    inner: Arc<ItemCacheInner<R::Item>>,
}

impl<R: ItemRequest> Clone for ItemCache<R> {
    fn clone(&self) -> Self {
        ItemCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ItemRequest> std::fmt::Debug for ItemCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemCache")
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<R: ItemRequest> ItemCache<R> {
    pub(crate) fn new(
        namespace: Namespace,
        policy: NamespacePolicy,
        snapshots: SnapshotHandle,
    ) -> Self {
        ItemCache {
            inner: Arc::new(ItemCacheInner {
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

    /// Returns the value for `request`, fetching it at most once.
    ///
    /// A fresh cache entry is returned immediately. Otherwise the caller
    /// joins the pending lookup for the key, or starts one: the fetch runs
    /// through the retry executor, and on success the result is written to
    /// the store and scheduled for a durable snapshot before any caller
    /// observes it.
    pub async fn get(&self, request: R) -> FetchResult<R::Item> {
        let key = request.cache_key();
        debug_assert_eq!(key.namespace(), self.namespace());

        if let Some(value) = self.inner.store.fresh_value(&key) {
            tracing::trace!(%key, "serving fresh entry");
            return Ok(value);
        }

        let inner = Arc::clone(&self.inner);
        let flight_key = key.clone();
        self.inner
            .flights
            .resolve(key, move |cancel| async move {
                let value = executor::execute(&inner.policy, &cancel, || {
                    request.fetch(cancel.clone())
                })
                .await?;

                inner.store.put(flight_key, value.clone());
                inner.snapshots.schedule_save(&inner.store);
                Ok(value)
            })
            .await
    }

    /// Cancels the pending lookup for `request`, if any.
    ///
    /// Every caller attached to it resolves with
    /// [`Cancelled`](crate::FetchError::Cancelled); a subsequent
    /// [`get`](Self::get) starts a brand-new lookup.
    pub fn cancel(&self, request: &R) {
        self.inner.flights.cancel(&request.cache_key());
    }

    /// Cancels every pending lookup in this namespace.
    pub fn cancel_all(&self) {
        self.inner.flights.cancel_all();
    }

    /// Drops the entry for `request`; the next [`get`](Self::get) fetches
    /// anew. Use after a mutation the cache cannot observe.
    pub fn evict(&self, request: &R) {
        self.inner.store.evict(&request.cache_key());
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

impl<R: ItemRequest> NamespaceFront for ItemCache<R> {
    fn namespace(&self) -> Namespace {
        ItemCache::namespace(self)
    }

    fn evict_all(&self) {
        ItemCache::evict_all(self);
    }
}
