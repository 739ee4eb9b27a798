use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::batch::{BatchCache, BatchRequest};
use crate::config::{Config, Namespace, default_write_queue_size};
use crate::item::{ItemCache, ItemRequest};
use crate::snapshot::{FilesystemBackend, SnapshotBackend, SnapshotHandle, SnapshotService};

/// A constructed namespace cache, seen through the invalidation
/// controller's eyes: something that can be emptied.
pub(crate) trait NamespaceFront: Send + Sync {
    fn namespace(&self) -> Namespace;
    fn evict_all(&self);
}

/// The cache subsystem's context object.
///
/// Constructed once at application start and passed to consumers; there is
/// no ambient module state, so tests get a fresh subsystem per context
/// while production keeps single-instance-per-process semantics by simply
/// constructing one.
///
/// Construction and the cache builders must run inside a tokio runtime:
/// the snapshot writer is a background task.
pub struct CacheContext {
    config: Config,
    snapshots: SnapshotHandle,
    fronts: Mutex<Vec<Arc<dyn NamespaceFront>>>,
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fronts = self.fronts.lock().map(|f| f.len()).unwrap_or_default();
        f.debug_struct("CacheContext")
            .field("config", &self.config)
            .field("fronts", &fronts)
            .finish()
    }
}

impl CacheContext {
    /// Builds a context from configuration, with filesystem-backed
    /// durable snapshots when a snapshot section is configured.
    pub fn new(config: Config) -> Result<Self> {
        let snapshots = match &config.snapshot {
            Some(snapshot) => {
                let backend = Arc::new(FilesystemBackend::new(&snapshot.path)?);
                SnapshotHandle::new(Arc::new(SnapshotService::new(
                    backend,
                    snapshot.max_write_queue_size,
                )))
            }
            None => SnapshotHandle::disabled(),
        };

        Ok(CacheContext {
            config,
            snapshots,
            fronts: Mutex::new(Vec::new()),
        })
    }

    /// Builds a context around a host-provided durable store.
    pub fn with_backend(config: Config, backend: Arc<dyn SnapshotBackend>) -> Self {
        let queue_size = config
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.max_write_queue_size)
            .unwrap_or_else(default_write_queue_size);

        CacheContext {
            config,
            snapshots: SnapshotHandle::new(Arc::new(SnapshotService::new(backend, queue_size))),
            fronts: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the cache front for a single-item namespace, hydrated from
    /// its durable record (stale rows are dropped during the load).
    pub async fn item_cache<R: ItemRequest>(&self, namespace: Namespace) -> ItemCache<R> {
        let policy = self.config.policy(namespace);
        let cache = ItemCache::new(namespace, policy, self.snapshots.clone());
        cache.hydrate(self.snapshots.load(namespace, &policy).await);

        self.register(Arc::new(cache.clone()));
        cache
    }

    /// Builds the cache front for a batched namespace, hydrated from its
    /// durable record.
    pub async fn batch_cache<R: BatchRequest>(&self, namespace: Namespace) -> BatchCache<R> {
        let policy = self.config.policy(namespace);
        let cache = BatchCache::new(namespace, policy, self.snapshots.clone());
        cache.hydrate(self.snapshots.load(namespace, &policy).await);

        self.register(Arc::new(cache.clone()));
        cache
    }

    fn register(&self, front: Arc<dyn NamespaceFront>) {
        self.fronts.lock().unwrap().push(front);
    }

    /// Empties one namespace everywhere: memory and durable record.
    ///
    /// Use after a mutation whose derived fields only the server can
    /// recompute; patching the cache would guess, eviction re-fetches.
    pub fn invalidate_namespace(&self, namespace: Namespace) {
        for front in self.fronts.lock().unwrap().iter() {
            if front.namespace() == namespace {
                front.evict_all();
            }
        }
        // cover namespaces whose front was not constructed in this process
        self.snapshots.schedule_remove(namespace);
    }

    /// Session-boundary eviction (login/logout).
    ///
    /// Empties every constructed front and deletes every namespace's
    /// durable record, so per-user data never leaks across identities --
    /// including records written by a previous process whose namespaces
    /// were never touched in this one.
    pub fn invalidate_all(&self) {
        for front in self.fronts.lock().unwrap().iter() {
            front.evict_all();
        }
        for namespace in Namespace::all() {
            self.snapshots.schedule_remove(*namespace);
        }
    }
}
