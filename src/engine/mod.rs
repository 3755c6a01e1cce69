//! Byte-store engines behind the two tiers.
//!
//! The store only depends on the [`OffHeapEngine`] and [`SwapEngine`]
//! contracts. Two reference engines ship with the crate:
//! - [`region`]: partitioned in-process byte region with a memory budget
//! - [`swap_file`]: disk-backed swap space, one file per entry
//! - [`evictor`]: victim selection used by the region when it runs out of budget

pub mod evictor;
pub mod region;
pub mod swap_file;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::context::Loader;
use crate::store::entry::{RawEntry, SwapKey};
use crate::store::iter::BoxedIter;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Space not found: {0}")]
    SpaceNotFound(String),

    #[error("Partition {partition} out of range for space {space}")]
    InvalidPartition { space: String, partition: u32 },

    #[error("Corrupt swap record: {0}")]
    Corrupt(PathBuf),
}

/// Receives entries the off-heap region evicts under memory pressure.
///
/// Invoked synchronously on the thread whose allocation triggered eviction,
/// after the region has released its own locks. Implementations must not
/// panic or propagate failures.
pub trait EvictListener: Send + Sync {
    fn on_evict(&self, partition: u32, key_hash: u32, key_bytes: Bytes, value_bytes: Bytes);
}

/// Off-heap memory region engine.
pub trait OffHeapEngine: Send + Sync {
    /// Create (or recreate, dropping prior contents) a space.
    ///
    /// `max_size` of 0 means unbounded.
    fn create(
        &self,
        space: &str,
        partitions: u32,
        init_size: u64,
        max_size: u64,
        listener: Option<Arc<dyn EvictListener>>,
    ) -> Result<(), EngineError>;

    /// Drop a space and everything in it.
    fn destroy(&self, space: &str) -> bool;

    fn contains(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError>;

    fn get(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError>;

    fn put(
        &self,
        space: &str,
        partition: u32,
        key_hash: u32,
        key_bytes: Bytes,
        value_bytes: Bytes,
    ) -> Result<(), EngineError>;

    /// Remove and return the stored value.
    fn remove(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError>;

    /// Remove without returning the value.
    fn delete(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError>;

    /// Iterate the whole space.
    fn iterator(&self, space: &str) -> Result<BoxedIter<RawEntry>, EngineError>;

    /// Iterate one partition.
    fn partition_iterator(&self, space: &str, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError>;

    fn entries_count(&self, space: &str) -> u64;

    fn allocated_size(&self, space: &str) -> u64;
}

/// Callback invoked once per key by swap removals: the removed bytes, or
/// `None` when the key was absent. May be called concurrently.
pub type RemoveCallback<'a, K> = &'a (dyn Fn(&SwapKey<K>, Option<Bytes>) + Sync);

/// Disk-backed swap space engine.
pub trait SwapEngine<K>: Send + Sync {
    fn read(&self, space: &str, key: &SwapKey<K>, loader: &Loader) -> Result<Option<Bytes>, EngineError>;

    fn write(&self, space: &str, key: &SwapKey<K>, value: Bytes, loader: &Loader) -> Result<(), EngineError>;

    fn write_all(&self, space: &str, entries: &[(SwapKey<K>, Bytes)], loader: &Loader) -> Result<(), EngineError>;

    fn remove(
        &self,
        space: &str,
        key: &SwapKey<K>,
        on_removed: RemoveCallback<'_, K>,
        loader: &Loader,
    ) -> Result<(), EngineError>;

    fn remove_all(
        &self,
        space: &str,
        keys: &[SwapKey<K>],
        on_removed: RemoveCallback<'_, K>,
        loader: &Loader,
    ) -> Result<(), EngineError>;

    /// Remove by partition and key bytes alone, without notifying anyone.
    /// Used to drop entries found by iteration, whose keys may not decode.
    fn delete(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError>;

    fn clear(&self, space: &str) -> Result<(), EngineError>;

    /// Iterate the whole space.
    fn raw_iterator(&self, space: &str) -> Result<BoxedIter<RawEntry>, EngineError>;

    /// Iterate one partition.
    fn partition_iterator(&self, space: &str, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError>;

    /// Total bytes stored.
    fn size(&self, space: &str) -> Result<u64, EngineError>;

    /// Number of stored keys.
    fn count(&self, space: &str) -> Result<u64, EngineError>;
}
