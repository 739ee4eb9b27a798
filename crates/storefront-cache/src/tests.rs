//! End-to-end behavior of the assembled subsystem.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchRequest;
use crate::config::{Config, Namespace, NamespacePolicy, PolicyConfigs};
use crate::context::CacheContext;
use crate::error::{FetchError, FetchResult};
use crate::item::ItemRequest;
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::snapshot::MemoryBackend;
use crate::test;

/// Availability of one product; counts how often the transport is hit.
#[derive(Clone)]
struct AvailabilityLookup {
    product: String,
    fetches: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
    fail_with: Arc<Mutex<Option<FetchError>>>,
}

impl AvailabilityLookup {
    fn new(product: &str) -> Self {
        AvailabilityLookup {
            product: product.to_owned(),
            fetches: Default::default(),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            fail_with: Default::default(),
        }
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn set_failure(&self, err: Option<FetchError>) {
        *self.fail_with.lock().unwrap() = err;
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ItemRequest for AvailabilityLookup {
    type Item = String;

    fn cache_key(&self) -> CacheKey {
        let mut builder = CacheKeyBuilder::new(Namespace::InventoryProduct);
        builder.write_param("product", &self.product).unwrap();
        builder.build()
    }

    fn fetch(&self, _cancel: CancellationToken) -> BoxFuture<'static, FetchResult<String>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        let fail = self.fail_with.lock().unwrap().clone();
        let product = self.product.clone();

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match fail {
                Some(err) => Err(err),
                None => Ok(format!("{product}: in stock")),
            }
        }
        .boxed()
    }
}

/// Availability of many variants in one call; records each requested
/// id set and can be told to "not know" certain ids.
#[derive(Clone)]
struct VariantBatchLookup {
    fetches: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<String>>>>,
    unknown: Arc<Mutex<HashSet<String>>>,
}

impl VariantBatchLookup {
    fn new() -> Self {
        VariantBatchLookup {
            fetches: Default::default(),
            batches: Default::default(),
            unknown: Default::default(),
        }
    }

    fn mark_unknown(&self, id: &str) {
        self.unknown.lock().unwrap().insert(id.to_owned());
    }

    fn recorded_batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl BatchRequest for VariantBatchLookup {
    type Id = String;
    type Item = u32;

    fn item_key(&self, id: &String) -> CacheKey {
        let mut builder = CacheKeyBuilder::new(Namespace::InventoryBatch);
        builder.write_param("variant", id).unwrap();
        builder.build()
    }

    fn fetch_batch(
        &self,
        ids: Vec<String>,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, FetchResult<HashMap<String, u32>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut recorded = ids.clone();
        recorded.sort();
        self.batches.lock().unwrap().push(recorded);
        let unknown = self.unknown.lock().unwrap().clone();

        async move {
            let items = ids
                .into_iter()
                .filter(|id| !unknown.contains(id))
                .map(|id| (id, 7u32))
                .collect();
            Ok(items)
        }
        .boxed()
    }
}

fn config_with_ttl(ttl: Duration) -> Config {
    let policy = NamespacePolicy {
        ttl,
        max_retries: 3,
        backoff: Duration::from_millis(1),
        in_memory_capacity: 1024,
    };
    Config {
        policies: PolicyConfigs {
            inventory_product: Some(policy),
            inventory_batch: Some(policy),
            wishlist: Some(policy),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn context(ttl: Duration) -> CacheContext {
    CacheContext::new(config_with_ttl(ttl)).unwrap()
}

#[tokio::test]
async fn test_concurrent_gets_share_one_fetch() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    request.set_delay(Duration::from_millis(50));

    let (a, b, c) = futures::join!(
        cache.get(request.clone()),
        cache.get(request.clone()),
        cache.get(request.clone()),
    );

    let expected = Ok("sku-1: in stock".to_owned());
    assert_eq!((a, b, c), (expected.clone(), expected.clone(), expected));
    assert_eq!(request.fetches(), 1);
}

#[tokio::test]
async fn test_coalesced_failure_reaches_every_caller() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    request.set_delay(Duration::from_millis(50));
    request.set_failure(Some(FetchError::AuthRequired));

    let (a, b) = futures::join!(cache.get(request.clone()), cache.get(request.clone()));
    assert_eq!(a, Err(FetchError::AuthRequired));
    assert_eq!(b, Err(FetchError::AuthRequired));
    // not retried, and fetched only once for both callers
    assert_eq!(request.fetches(), 1);

    // failures are not cached either: the next get fetches again
    request.set_failure(None);
    request.set_delay(Duration::ZERO);
    assert!(cache.get(request.clone()).await.is_ok());
    assert_eq!(request.fetches(), 2);
}

#[tokio::test]
async fn test_ttl_expiry_triggers_exactly_one_refetch() {
    test::setup();
    let ctx = context(Duration::from_millis(150));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    cache.get(request.clone()).await.unwrap();
    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    cache.get(request.clone()).await.unwrap();
    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 2);
}

#[tokio::test]
async fn test_batch_fetches_only_the_misses() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.batch_cache::<VariantBatchLookup>(Namespace::InventoryBatch).await;

    let request = VariantBatchLookup::new();
    let warm = cache
        .get_batch(request.clone(), &["a".to_owned()])
        .await
        .unwrap();
    assert_eq!(warm.len(), 1);

    let ids = ["a".to_owned(), "b".to_owned(), "c".to_owned()];
    let result = cache.get_batch(request.clone(), &ids).await.unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result["a"], 7);
    assert_eq!(
        request.recorded_batches(),
        vec![vec!["a".to_owned()], vec!["b".to_owned(), "c".to_owned()]]
    );

    // a fully warm batch does not touch the transport at all
    let again = cache.get_batch(request.clone(), &ids).await.unwrap();
    assert_eq!(again.len(), 3);
    assert_eq!(request.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batch_omits_unknown_ids() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.batch_cache::<VariantBatchLookup>(Namespace::InventoryBatch).await;

    let request = VariantBatchLookup::new();
    cache
        .get_batch(request.clone(), &["a".to_owned()])
        .await
        .unwrap();

    request.mark_unknown("c");
    let ids = ["a".to_owned(), "b".to_owned(), "c".to_owned()];
    let result = cache.get_batch(request.clone(), &ids).await.unwrap();

    assert_eq!(result.len(), 2);
    assert!(result.contains_key("a"));
    assert!(result.contains_key("b"));
    assert!(!result.contains_key("c"));
}

#[tokio::test]
async fn test_namespace_invalidation_forces_a_fetch() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 1);

    ctx.invalidate_namespace(Namespace::InventoryProduct);
    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 2);
}

#[tokio::test]
async fn test_cancelled_operation_resolves_every_caller() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    request.set_delay(Duration::from_secs(30));

    let a = tokio::spawn({
        let cache = cache.clone();
        let request = request.clone();
        async move { cache.get(request).await }
    });
    let b = tokio::spawn({
        let cache = cache.clone();
        let request = request.clone();
        async move { cache.get(request).await }
    });

    // both callers must be attached before we cancel
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.cancel(&request);

    assert_eq!(a.await.unwrap(), Err(FetchError::Cancelled));
    assert_eq!(b.await.unwrap(), Err(FetchError::Cancelled));
    assert_eq!(request.fetches(), 1);

    // the cancelled operation is gone; a new get starts from scratch
    request.set_delay(Duration::ZERO);
    assert_eq!(
        cache.get(request.clone()).await,
        Ok("sku-1: in stock".to_owned())
    );
    assert_eq!(request.fetches(), 2);
}

#[tokio::test]
async fn test_transient_failures_exhaust_the_budget() {
    test::setup();
    let ctx = context(Duration::from_secs(60));
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    request.set_failure(Some(FetchError::Transient("503".into())));

    let result = cache.get(request.clone()).await;
    assert_eq!(request.fetches(), 3);
    assert_eq!(
        result,
        Err(FetchError::Permanent("retries exhausted: 503".into()))
    );
}

#[tokio::test]
async fn test_snapshot_survives_a_restart_within_ttl() {
    test::setup();
    let backend = Arc::new(MemoryBackend::new());
    let config = config_with_ttl(Duration::from_millis(400));

    let request = AvailabilityLookup::new("sku-1");
    {
        let ctx = CacheContext::with_backend(config.clone(), backend.clone());
        let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;
        cache.get(request.clone()).await.unwrap();
        assert_eq!(request.fetches(), 1);

        // the snapshot write is asynchronous; give the queue a moment
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.record("inventory-product").is_some());
    }

    // "restart": a fresh context over the same durable store
    let ctx = CacheContext::with_backend(config.clone(), backend.clone());
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;
    let value = cache.get(request.clone()).await.unwrap();
    assert_eq!(value, "sku-1: in stock");
    // served from the rehydrated entry, no network
    assert_eq!(request.fetches(), 1);

    // once the entry's age exceeds the TTL, a restart must not resurrect it
    tokio::time::sleep(Duration::from_millis(400)).await;
    let ctx = CacheContext::with_backend(config, backend);
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;
    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 2);
}

#[tokio::test]
async fn test_invalidate_all_clears_durable_records() {
    test::setup();
    let backend = Arc::new(MemoryBackend::new());
    let config = config_with_ttl(Duration::from_secs(60));

    let ctx = CacheContext::with_backend(config, backend.clone());
    let cache = ctx.item_cache::<AvailabilityLookup>(Namespace::InventoryProduct).await;

    let request = AvailabilityLookup::new("sku-1");
    cache.get(request.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.record("inventory-product").is_some());

    // a leftover record from another namespace must be wiped as well
    backend.set_record("wishlist", b"[]".to_vec());

    ctx.invalidate_all();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(backend.record("inventory-product").is_none());
    assert!(backend.record("wishlist").is_none());

    cache.get(request.clone()).await.unwrap();
    assert_eq!(request.fetches(), 2);
}
