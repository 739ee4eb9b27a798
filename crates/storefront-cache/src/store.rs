use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{Namespace, NamespacePolicy};
use crate::key::CacheKey;

/// Effectively "never" for entries whose deadline cannot be represented.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// A single cache entry.
///
/// Entries are immutable once stored; a refresh replaces the entry
/// wholesale. `stored_at` is wall-clock time so that snapshot rows stay
/// comparable across process restarts.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub(crate) fn new(value: T) -> Self {
        CacheEntry {
            value,
            stored_at: Utc::now(),
        }
    }

    /// Rebuilds an entry from a snapshot row, keeping its original
    /// timestamp so the freshness rule keeps applying to it.
    pub(crate) fn with_timestamp(value: T, stored_at: DateTime<Utc>) -> Self {
        CacheEntry { value, stored_at }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    /// An entry is fresh iff it is younger than the namespace TTL.
    ///
    /// A negative age (clock moved backwards) counts as fresh.
    pub fn is_fresh(&self, policy: &NamespacePolicy) -> bool {
        match chrono::Duration::from_std(policy.ttl) {
            Ok(ttl) => Utc::now().signed_duration_since(self.stored_at) < ttl,
            Err(_) => true,
        }
    }

    /// Time until this entry stops being fresh.
    fn time_to_live(&self, ttl: Duration) -> Duration {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return FAR_FUTURE;
        };
        match self.stored_at.checked_add_signed(ttl) {
            Some(deadline) => deadline
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => FAR_FUTURE,
        }
    }
}

/// Evicts entries from the in-memory cache once they stop being fresh.
struct EntryExpiry {
    ttl: Duration,
}

impl<T> moka::Expiry<CacheKey, CacheEntry<T>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry<T>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.time_to_live(self.ttl))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry<T>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.time_to_live(self.ttl))
    }
}

/// In-memory store for one namespace.
///
/// Lookups never block and never trigger a fetch; `put` overwrites
/// unconditionally (the coalescing registry guarantees a single writer
/// per key, so last-write-wins is a total order, not a race). Capacity is
/// bounded per namespace, and entries expire at their freshness deadline.
pub struct CacheStore<T: Clone + Send + Sync + 'static> {
    namespace: Namespace,
    policy: NamespacePolicy,
    entries: moka::sync::Cache<CacheKey, CacheEntry<T>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> CacheStore<T> {
    pub fn new(namespace: Namespace, policy: NamespacePolicy) -> Self {
        let entries = moka::sync::Cache::builder()
            .name(namespace.as_str())
            .max_capacity(policy.in_memory_capacity)
            .expire_after(EntryExpiry { ttl: policy.ttl })
            .build();

        CacheStore {
            namespace,
            policy,
            entries,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Pure lookup. Returns the entry whether or not it is still fresh;
    /// use [`is_fresh`](Self::is_fresh) or
    /// [`fresh_value`](Self::fresh_value) to apply the freshness rule.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        self.entries.get(key)
    }

    /// The entry's value, but only while it is fresh.
    pub fn fresh_value(&self, key: &CacheKey) -> Option<T> {
        self.get(key)
            .filter(|entry| entry.is_fresh(&self.policy))
            .map(CacheEntry::into_value)
    }

    pub fn is_fresh(&self, entry: &CacheEntry<T>) -> bool {
        entry.is_fresh(&self.policy)
    }

    pub fn put(&self, key: CacheKey, value: T) {
        self.entries.insert(key, CacheEntry::new(value));
    }

    /// Inserts an entry rehydrated from a snapshot, original timestamp
    /// included.
    pub(crate) fn insert_entry(&self, key: CacheKey, entry: CacheEntry<T>) {
        self.entries.insert(key, entry);
    }

    pub fn evict(&self, key: &CacheKey) {
        self.entries.invalidate(key);
    }

    pub fn evict_all(&self) {
        self.entries.invalidate_all();
    }

    /// All current entries, for snapshotting.
    pub(crate) fn entries(&self) -> Vec<(CacheKey, CacheEntry<T>)> {
        self.entries
            .iter()
            .map(|(key, entry)| ((*key).clone(), entry))
            .collect()
    }
}
