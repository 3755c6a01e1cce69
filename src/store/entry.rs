//! Swap entry types.
//!
//! An entry travels between tiers as an [`EntryEnvelope`]: value bytes plus the
//! metadata needed to rebuild the cache entry. Only the encoded envelope is ever
//! stored in a tier; a [`SwapEntry`] is the decoded, materialized form handed
//! back to callers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies which storage tier an entry was found in or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierKind {
    /// Off-heap memory region (warm).
    OffHeap,
    /// Disk-backed swap space (cold).
    Swap,
}

impl TierKind {
    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            TierKind::OffHeap => 0,
            TierKind::Swap => 1,
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::OffHeap => write!(f, "OFFHEAP"),
            TierKind::Swap => write!(f, "SWAP"),
        }
    }
}

/// Opaque id of the deployment unit whose loader decodes a key or value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderId(pub Uuid);

impl LoaderId {
    /// Allocate a fresh random loader id.
    pub fn random() -> Self {
        LoaderId(Uuid::new_v4())
    }
}

impl std::fmt::Display for LoaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry version as assigned by the owning cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheVersion {
    pub topology_version: u32,
    pub order: u64,
    pub node_order: u32,
}

impl CacheVersion {
    pub fn new(topology_version: u32, order: u64, node_order: u32) -> Self {
        Self {
            topology_version,
            order,
            node_order,
        }
    }
}

/// Hash of a key's marshalled form, as carried in the envelope and handed to
/// eviction listeners.
pub fn key_hash(key_bytes: &[u8]) -> u32 {
    let mut hasher = DefaultHasher::new();
    key_bytes.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// The at-rest form of a swapped entry.
///
/// `value_bytes` always holds the value: either the raw byte array itself
/// (`value_is_bytes`) or the marshalled object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryEnvelope {
    pub key_hash: u32,
    pub value_bytes: Bytes,
    pub value_is_bytes: bool,
    pub version: CacheVersion,
    /// Time to live in milliseconds (0 = eternal).
    pub ttl: u64,
    /// Absolute expiration time in epoch milliseconds (0 = never).
    pub expire_time: u64,
    pub key_loader: Option<LoaderId>,
    pub value_loader: Option<LoaderId>,
}

impl EntryEnvelope {
    /// Envelope for a marshalled object value.
    pub fn object(key_hash: u32, value_bytes: impl Into<Bytes>, version: CacheVersion) -> Self {
        Self {
            key_hash,
            value_bytes: value_bytes.into(),
            value_is_bytes: false,
            version,
            ttl: 0,
            expire_time: 0,
            key_loader: None,
            value_loader: None,
        }
    }

    /// Envelope for a value that is itself a byte array.
    pub fn raw(key_hash: u32, value: impl Into<Bytes>, version: CacheVersion) -> Self {
        Self {
            value_is_bytes: true,
            ..Self::object(key_hash, value, version)
        }
    }

    pub fn with_ttl(mut self, ttl: u64, expire_time: u64) -> Self {
        self.ttl = ttl;
        self.expire_time = expire_time;
        self
    }

    pub fn with_loaders(mut self, key_loader: Option<LoaderId>, value_loader: Option<LoaderId>) -> Self {
        self.key_loader = key_loader;
        self.value_loader = value_loader;
        self
    }
}

/// A materialized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapValue<V> {
    /// The cached value is a plain byte array.
    Bytes(Bytes),
    /// The cached value was unmarshalled into an object.
    Object(V),
}

impl<V> SwapValue<V> {
    pub fn as_object(&self) -> Option<&V> {
        match self {
            SwapValue::Object(v) => Some(v),
            SwapValue::Bytes(_) => None,
        }
    }

    pub fn into_object(self) -> Option<V> {
        match self {
            SwapValue::Object(v) => Some(v),
            SwapValue::Bytes(_) => None,
        }
    }
}

/// A decoded swap entry whose value has been materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapEntry<V> {
    pub value: SwapValue<V>,
    pub envelope: EntryEnvelope,
}

impl<V> SwapEntry<V> {
    pub fn value(&self) -> &SwapValue<V> {
        &self.value
    }

    pub fn value_bytes(&self) -> &Bytes {
        &self.envelope.value_bytes
    }

    pub fn version(&self) -> CacheVersion {
        self.envelope.version
    }

    pub fn ttl(&self) -> u64 {
        self.envelope.ttl
    }

    pub fn expire_time(&self) -> u64 {
        self.envelope.expire_time
    }

    pub fn key_loader(&self) -> Option<LoaderId> {
        self.envelope.key_loader
    }

    pub fn value_loader(&self) -> Option<LoaderId> {
        self.envelope.value_loader
    }
}

/// Addressing unit accepted by the swap engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SwapKey<K> {
    pub key: K,
    pub partition: u32,
    pub key_bytes: Bytes,
}

impl<K> SwapKey<K> {
    pub fn new(key: K, partition: u32, key_bytes: impl Into<Bytes>) -> Self {
        Self {
            key,
            partition,
            key_bytes: key_bytes.into(),
        }
    }
}

/// An entry used by bulk operations, where the key travels with the value.
///
/// `value` is set on entries returned from reads and is `None` on entries
/// submitted for writing.
#[derive(Debug, Clone)]
pub struct BatchSwapEntry<K, V> {
    pub key: K,
    pub key_bytes: Bytes,
    pub partition: u32,
    pub envelope: EntryEnvelope,
    pub value: Option<SwapValue<V>>,
}

impl<K, V> BatchSwapEntry<K, V> {
    /// Build a batch entry for writing.
    pub fn new(key: K, key_bytes: impl Into<Bytes>, partition: u32, envelope: EntryEnvelope) -> Self {
        Self {
            key,
            key_bytes: key_bytes.into(),
            partition,
            envelope,
            value: None,
        }
    }

    /// Build a batch entry from an entry just removed from a tier.
    pub fn unswapped(key: K, key_bytes: Bytes, partition: u32, entry: SwapEntry<V>) -> Self {
        Self {
            key,
            key_bytes,
            partition,
            envelope: entry.envelope,
            value: Some(entry.value),
        }
    }

    pub fn key_hash(&self) -> u32 {
        self.envelope.key_hash
    }

    pub(crate) fn swap_key(&self) -> SwapKey<K>
    where
        K: Clone,
    {
        SwapKey::new(self.key.clone(), self.partition, self.key_bytes.clone())
    }
}

/// A raw key/value pair as stored by a tier.
///
/// `partition` is where the tier found it, so the entry can be removed again
/// without decoding the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub partition: u32,
    pub key_bytes: Bytes,
    pub value_bytes: Bytes,
}

impl RawEntry {
    pub fn new(partition: u32, key_bytes: impl Into<Bytes>, value_bytes: impl Into<Bytes>) -> Self {
        Self {
            partition,
            key_bytes: key_bytes.into(),
            value_bytes: value_bytes.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert_eq!(TierKind::OffHeap.level(), 0);
        assert_eq!(TierKind::Swap.level(), 1);
        assert_eq!(TierKind::OffHeap.to_string(), "OFFHEAP");
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash(b"k1"), key_hash(b"k1"));
        assert_ne!(key_hash(b"k1"), key_hash(b"k2"));
    }

    #[test]
    fn test_raw_envelope_flags() {
        let env = EntryEnvelope::raw(7, vec![1u8, 2, 3], CacheVersion::new(1, 2, 3))
            .with_ttl(100, 5000);
        assert!(env.value_is_bytes);
        assert_eq!(env.ttl, 100);
        assert_eq!(env.expire_time, 5000);
        assert!(env.key_loader.is_none());
    }

    #[test]
    fn test_version_ordering() {
        assert!(CacheVersion::new(1, 5, 0) < CacheVersion::new(1, 6, 0));
        assert!(CacheVersion::new(2, 0, 0) > CacheVersion::new(1, 9, 9));
    }
}
