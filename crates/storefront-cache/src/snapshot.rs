use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use crate::config::{Namespace, NamespacePolicy};
use crate::key::CacheKey;
use crate::store::{CacheEntry, CacheStore};

/// A host-provided durable key-value store.
///
/// Holds one record per namespace, written as a whole on every change and
/// read once at start-up. Implementations must treat records as opaque
/// bytes; the caller owns the format.
pub trait SnapshotBackend: Send + Sync + 'static {
    /// Reads a record, `None` if it does not exist.
    fn get(&self, record: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Replaces a record.
    fn put(&self, record: &str, data: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// Deletes a record. Deleting a missing record is not an error.
    fn remove(&self, record: &str) -> BoxFuture<'_, Result<()>>;
}

/// Snapshot records as files in one directory.
///
/// Writes go through a temp file that is persisted over the record, so a
/// crash mid-write leaves the previous record intact rather than a
/// truncated one.
pub struct FilesystemBackend {
    path: PathBuf,
}

impl FilesystemBackend {
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .context("failed to create snapshot directory")?;
        Ok(FilesystemBackend {
            path: path.to_path_buf(),
        })
    }

    fn record_path(&self, record: &str) -> PathBuf {
        self.path.join(record)
    }
}

impl SnapshotBackend for FilesystemBackend {
    fn get(&self, record: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let path = self.record_path(record);
        async move {
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).context("failed to read snapshot record"),
            }
        }
        .boxed()
    }

    fn put(&self, record: &str, data: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        let path = self.record_path(record);
        let dir = self.path.clone();
        async move {
            let write = tokio::task::spawn_blocking(move || -> Result<()> {
                let mut temp_file = NamedTempFile::new_in(&dir)?;
                temp_file.write_all(&data)?;
                temp_file.persist(&path).map_err(|e| e.error)?;
                Ok(())
            });
            write.await.context("snapshot write task failed")?
        }
        .boxed()
    }

    fn remove(&self, record: &str) -> BoxFuture<'_, Result<()>> {
        let path = self.record_path(record);
        async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).context("failed to remove snapshot record"),
            }
        }
        .boxed()
    }
}

/// An in-memory backend, for tests and for hosts without durable storage.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct record access, mainly useful in tests.
    pub fn record(&self, record: &str) -> Option<Vec<u8>> {
        self.records.lock().unwrap().get(record).cloned()
    }

    /// Overwrites a record without going through the write queue.
    pub fn set_record(&self, record: &str, data: Vec<u8>) {
        self.records.lock().unwrap().insert(record.to_owned(), data);
    }
}

impl SnapshotBackend for MemoryBackend {
    fn get(&self, record: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        let data = self.records.lock().unwrap().get(record).cloned();
        async move { Ok(data) }.boxed()
    }

    fn put(&self, record: &str, data: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        self.records.lock().unwrap().insert(record.to_owned(), data);
        async move { Ok(()) }.boxed()
    }

    fn remove(&self, record: &str) -> BoxFuture<'_, Result<()>> {
        self.records.lock().unwrap().remove(record);
        async move { Ok(()) }.boxed()
    }
}

/// One serialized cache entry. The key is stored as its metadata, from
/// which the identical [`CacheKey`] is re-derived on load.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRow<T> {
    key: String,
    value: T,
    stored_at: DateTime<Utc>,
}

enum WriteJob {
    Save { record: String, payload: Vec<u8> },
    Remove { record: String },
}

/// Background writer draining the snapshot queue.
///
/// All writes are fire-and-forget: a failure is logged and never reaches
/// the caller whose fetch triggered the write.
pub(crate) struct SnapshotService {
    tx: mpsc::Sender<WriteJob>,
    backend: Arc<dyn SnapshotBackend>,
}

impl SnapshotService {
    pub(crate) fn new(backend: Arc<dyn SnapshotBackend>, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(queue_size.max(1));

        let worker_backend = Arc::clone(&backend);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let (record, outcome) = match job {
                    WriteJob::Save { record, payload } => {
                        let outcome = worker_backend.put(&record, payload).await;
                        (record, outcome)
                    }
                    WriteJob::Remove { record } => {
                        let outcome = worker_backend.remove(&record).await;
                        (record, outcome)
                    }
                };
                if let Err(err) = outcome {
                    tracing::warn!(record = %record, "snapshot write failed: {err:#}");
                }
            }
        });

        SnapshotService { tx, backend }
    }
}

/// Handle through which caches schedule snapshot work.
///
/// A disabled handle (no durable storage configured) turns every
/// operation into a no-op, so the caching paths do not branch on
/// configuration.
#[derive(Clone)]
pub(crate) struct SnapshotHandle {
    service: Option<Arc<SnapshotService>>,
}

impl SnapshotHandle {
    pub(crate) fn disabled() -> Self {
        SnapshotHandle { service: None }
    }

    pub(crate) fn new(service: Arc<SnapshotService>) -> Self {
        SnapshotHandle {
            service: Some(service),
        }
    }

    /// Serializes the namespace's current entries and queues a
    /// whole-record write. Best-effort: serialization failures and a full
    /// queue only log.
    pub(crate) fn schedule_save<T>(&self, store: &CacheStore<T>)
    where
        T: Clone + Serialize + Send + Sync + 'static,
    {
        let Some(service) = &self.service else {
            return;
        };

        let rows: Vec<SnapshotRow<T>> = store
            .entries()
            .into_iter()
            .map(|(key, entry)| SnapshotRow {
                key: key.metadata().to_owned(),
                stored_at: entry.stored_at(),
                value: entry.into_value(),
            })
            .collect();

        let payload = match serde_json::to_vec(&rows) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(namespace = %store.namespace(), "failed to serialize snapshot: {err}");
                return;
            }
        };

        let job = WriteJob::Save {
            record: store.namespace().as_str().to_owned(),
            payload,
        };
        if service.tx.try_send(job).is_err() {
            tracing::warn!(namespace = %store.namespace(), "snapshot queue full, dropping write");
        }
    }

    /// Queues deletion of the namespace's durable record.
    pub(crate) fn schedule_remove(&self, namespace: Namespace) {
        let Some(service) = &self.service else {
            return;
        };
        let job = WriteJob::Remove {
            record: namespace.as_str().to_owned(),
        };
        if service.tx.try_send(job).is_err() {
            tracing::warn!(%namespace, "snapshot queue full, dropping record removal");
        }
    }

    /// Loads and freshness-filters the record for `namespace`.
    ///
    /// Runs once per namespace at start-up. Stale rows are dropped here
    /// rather than at read time, so an old snapshot cannot resurrect
    /// ancient data. An unreadable or malformed record means "no cache",
    /// never an error.
    pub(crate) async fn load<T>(
        &self,
        namespace: Namespace,
        policy: &NamespacePolicy,
    ) -> Vec<(CacheKey, CacheEntry<T>)>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
    {
        let Some(service) = &self.service else {
            return Vec::new();
        };

        let data = match service.backend.get(namespace.as_str()).await {
            Ok(Some(data)) => data,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::warn!(%namespace, "failed to load snapshot: {err:#}");
                return Vec::new();
            }
        };

        let rows: Vec<SnapshotRow<T>> = match serde_json::from_slice(&data) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%namespace, "malformed snapshot record, ignoring: {err}");
                return Vec::new();
            }
        };

        let total = rows.len();
        let mut entries = Vec::with_capacity(total);
        for row in rows {
            let entry = CacheEntry::with_timestamp(row.value, row.stored_at);
            if !entry.is_fresh(policy) {
                continue;
            }
            entries.push((CacheKey::from_metadata(namespace, row.key), entry));
        }

        tracing::debug!(
            %namespace,
            loaded = entries.len(),
            dropped = total - entries.len(),
            "rehydrated snapshot"
        );
        entries
    }
}
