//! # Storefront data caching
//!
//! A client-side data cache with request coalescing for storefront
//! lookups. Wishlist contents, inventory availability, analytics
//! activity and product recommendations all share the same access
//! pattern: a slow REST lookup whose result stays usable for a while,
//! requested redundantly by whatever happens to be on screen. This crate
//! implements that pattern once, parameterized by a namespace policy
//! table and a caller-supplied fetch function; each call site is reduced
//! to a thin request struct around its actual REST call.
//!
//! ## Layers
//!
//! A lookup travels through the following layers:
//!
//! - An in-memory, namespace-scoped TTL store ([`CacheStore`]). A fresh
//!   entry answers the lookup immediately.
//! - A coalescing registry (single-flight): concurrent lookups for the
//!   same [`CacheKey`] share one pending operation and settle together.
//!   This is the central correctness property of the subsystem: for any
//!   key, at most one underlying fetch is outstanding at a time. Without
//!   it, every widget asking for the same product's availability would
//!   issue its own network call.
//! - A fetch executor that retries transient failures with bounded,
//!   linear backoff and honors cooperative cancellation
//!   ([`executor::execute`]).
//! - A durable snapshot ([`snapshot`]): cache contents are persisted per
//!   namespace into a host-provided durable store, fire-and-forget, and
//!   rehydrated at start-up subject to the same freshness rule.
//!
//! Batched namespaces ([`BatchCache`]) add a resolver in front: a
//! multi-id request is partitioned into cache hits and misses, the
//! misses are fetched in exactly one coalesced call keyed by the sorted,
//! deduplicated miss set, and every returned item is stored individually
//! so later single-item lookups hit the cache too. Ids the backend did
//! not answer are omitted from the result, not errors: a missing id
//! means "unknown", and callers must not read it as "out of stock".
//!
//! ## Freshness
//!
//! Every entry records its wall-clock store time; an entry is fresh
//! while it is younger than its namespace's TTL. There is no hard
//! deadline on an in-flight fetch itself; a slow fetch is bounded by the
//! executor's retry budget, and staleness is enforced at read time.
//!
//! ## Errors
//!
//! Lookups fail with a small taxonomy ([`FetchError`]): `Transient`
//! failures are retried and only surface, re-classified as `Permanent`,
//! once the budget is spent; `AuthRequired` propagates distinctly so the
//! UI can prompt re-authentication; `Cancelled` is a silent outcome, not
//! a failure. Snapshot failures never propagate at all, they are logged.
//! Errors are never cached.
//!
//! ## Invalidation
//!
//! Mutations the cache cannot observe (a wishlist edit, a checkout) are
//! handled by explicit eviction: per key, per namespace, or everything
//! via [`CacheContext::invalidate_all`], the latter wired to session
//! boundaries so personalized data never survives an identity change.
//!
//! ## Usage
//!
//! Construct a [`Config`] (YAML, see [`Config::get`]), build one
//! [`CacheContext`] at application start, and derive per-namespace
//! fronts from it. Implement [`ItemRequest`] or [`BatchRequest`] per
//! call site.

pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
mod flight;
pub mod item;
pub mod key;
pub mod logging;
pub mod snapshot;
pub mod store;

pub use batch::{BatchCache, BatchRequest};
pub use config::{
    Config, LogFormat, Logging, Namespace, NamespacePolicy, PolicyConfigs, SnapshotConfig,
};
pub use context::CacheContext;
pub use error::{FetchError, FetchResult};
pub use item::{ItemCache, ItemRequest};
pub use key::{CacheKey, CacheKeyBuilder};
pub use snapshot::{FilesystemBackend, MemoryBackend, SnapshotBackend};
pub use store::{CacheEntry, CacheStore};

// Part of the `ItemRequest`/`BatchRequest` contracts.
pub use tokio_util::sync::CancellationToken;


#[cfg(test)]
mod tests;
