use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::Namespace;

/// Identifies one logical lookup within a namespace.
///
/// A key is derived from stable, human-readable metadata: the namespace name
/// followed by the ordered, normalized parameters of the lookup. The metadata
/// is SHA-256 hashed, and the hash alone forms the key's identity. Derivation
/// is a pure function: equal logical requests always produce equal keys.
///
/// The metadata is kept around for debugging and for snapshot rows, from
/// which the identical key can be re-derived on load.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    namespace: Namespace,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.namespace)?;
        for b in &self.hash[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl CacheKey {
    /// The namespace this key belongs to.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The human-readable metadata that forms the basis of this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Builds the key for a batched lookup of the given id set.
    ///
    /// Callers must pass the ids sorted and deduplicated, so two batches
    /// that differ only in ordering or duplicates coalesce onto the same
    /// pending operation.
    pub fn for_batch<I>(namespace: Namespace, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        let mut builder = CacheKeyBuilder::new(namespace);
        for id in ids {
            writeln!(builder, "{id}").unwrap();
        }
        builder.build()
    }

    /// Re-derives a key from metadata previously produced by a builder.
    ///
    /// Key derivation is pure, so hashing the stored metadata yields the
    /// original identity. Used when rehydrating snapshot rows.
    pub(crate) fn from_metadata(namespace: Namespace, metadata: String) -> Self {
        let hash = Sha256::digest(&metadata);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).unwrap_or_default();

        CacheKey {
            namespace,
            metadata: metadata.into(),
            hash,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_testing(namespace: Namespace, key: impl Into<String>) -> Self {
        Self::from_metadata(namespace, key.into())
    }
}

/// A builder for [`CacheKey`]s.
///
/// Implements [`fmt::Write`]; the intention is to feed it human readable,
/// but most importantly **stable**, input. Parameters must be written in a
/// fixed order and normalized (sorted id lists, canonical flag spelling)
/// before writing, or equal logical requests will miss each other's cache
/// entries.
pub struct CacheKeyBuilder {
    namespace: Namespace,
    metadata: String,
}

impl CacheKeyBuilder {
    pub fn new(namespace: Namespace) -> Self {
        CacheKeyBuilder {
            namespace,
            metadata: format!("namespace: {namespace}\n"),
        }
    }

    /// Writes one named lookup parameter into the key.
    pub fn write_param(&mut self, name: &str, value: impl fmt::Display) -> fmt::Result {
        self.metadata.write_fmt(format_args!("{name}: {value}\n"))
    }

    /// Finalizes the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        CacheKey::from_metadata(self.namespace, self.metadata)
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
