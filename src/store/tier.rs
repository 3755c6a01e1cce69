//! Thin adapters binding the engines to one cache's space.
//!
//! [`OffHeapTier`] and [`SwapTier`] carry the space name and the creation
//! parameters so the store never repeats them. [`SpillToSwap`] is the
//! eviction callback handed to the off-heap region: it moves evicted bytes
//! into the swap tier.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::context::{EventKind, Loader, StoreContext};
use crate::engine::{EngineError, EvictListener, OffHeapEngine, RemoveCallback, SwapEngine};
use crate::store::codec::EntryCodec;
use crate::store::entry::{RawEntry, SwapKey};
use crate::store::iter::BoxedIter;

/// The cache's space inside the off-heap region.
pub struct OffHeapTier {
    engine: Arc<dyn OffHeapEngine>,
    space: String,
    partitions: u32,
    init_size: u64,
    max_size: u64,
    listener: Option<Arc<dyn EvictListener>>,
}

impl OffHeapTier {
    /// Create the region space.
    pub fn create(
        engine: Arc<dyn OffHeapEngine>,
        space: impl Into<String>,
        partitions: u32,
        init_size: u64,
        max_size: u64,
        listener: Option<Arc<dyn EvictListener>>,
    ) -> Result<Self, EngineError> {
        let tier = Self {
            engine,
            space: space.into(),
            partitions,
            init_size,
            max_size,
            listener,
        };
        tier.init()?;
        Ok(tier)
    }

    fn init(&self) -> Result<(), EngineError> {
        self.engine.create(
            &self.space,
            self.partitions,
            self.init_size,
            self.max_size,
            self.listener.clone(),
        )
    }

    /// Drop everything by recreating the space.
    pub fn clear(&self) -> Result<(), EngineError> {
        self.init()
    }

    pub fn contains(&self, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        self.engine.contains(&self.space, partition, key_bytes)
    }

    pub fn get(&self, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError> {
        self.engine.get(&self.space, partition, key_bytes)
    }

    pub fn put(&self, partition: u32, key_hash: u32, key_bytes: Bytes, value: Bytes) -> Result<(), EngineError> {
        self.engine.put(&self.space, partition, key_hash, key_bytes, value)
    }

    pub fn remove(&self, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError> {
        self.engine.remove(&self.space, partition, key_bytes)
    }

    pub fn delete(&self, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        self.engine.delete(&self.space, partition, key_bytes)
    }

    pub fn iterator(&self) -> Result<BoxedIter<RawEntry>, EngineError> {
        self.engine.iterator(&self.space)
    }

    pub fn partition_iterator(&self, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError> {
        self.engine.partition_iterator(&self.space, partition)
    }

    pub fn entries_count(&self) -> u64 {
        self.engine.entries_count(&self.space)
    }

    pub fn allocated_size(&self) -> u64 {
        self.engine.allocated_size(&self.space)
    }
}

/// The cache's space inside the swap subsystem.
///
/// Every call passes the global loader, which the engine uses to decode keys.
pub struct SwapTier<K> {
    engine: Arc<dyn SwapEngine<K>>,
    space: String,
    loader: Loader,
}

impl<K> SwapTier<K> {
    pub fn new(engine: Arc<dyn SwapEngine<K>>, space: impl Into<String>, loader: Loader) -> Self {
        Self {
            engine,
            space: space.into(),
            loader,
        }
    }

    pub fn read(&self, key: &SwapKey<K>) -> Result<Option<Bytes>, EngineError> {
        self.engine.read(&self.space, key, &self.loader)
    }

    pub fn write(&self, key: &SwapKey<K>, value: Bytes) -> Result<(), EngineError> {
        self.engine.write(&self.space, key, value, &self.loader)
    }

    pub fn write_all(&self, entries: &[(SwapKey<K>, Bytes)]) -> Result<(), EngineError> {
        self.engine.write_all(&self.space, entries, &self.loader)
    }

    pub fn remove(&self, key: &SwapKey<K>, on_removed: RemoveCallback<'_, K>) -> Result<(), EngineError> {
        self.engine.remove(&self.space, key, on_removed, &self.loader)
    }

    pub fn remove_all(&self, keys: &[SwapKey<K>], on_removed: RemoveCallback<'_, K>) -> Result<(), EngineError> {
        self.engine.remove_all(&self.space, keys, on_removed, &self.loader)
    }

    pub fn delete(&self, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        self.engine.delete(&self.space, partition, key_bytes)
    }

    pub fn clear(&self) -> Result<(), EngineError> {
        self.engine.clear(&self.space)
    }

    pub fn raw_iterator(&self) -> Result<BoxedIter<RawEntry>, EngineError> {
        self.engine.raw_iterator(&self.space)
    }

    pub fn partition_iterator(&self, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError> {
        self.engine.partition_iterator(&self.space, partition)
    }

    pub fn size(&self) -> Result<u64, EngineError> {
        self.engine.size(&self.space)
    }

    pub fn count(&self) -> Result<u64, EngineError> {
        self.engine.count(&self.space)
    }
}

/// Eviction callback moving region victims into swap.
///
/// With no swap tier the victim is dropped. Failures are logged; eviction
/// never fails.
pub struct SpillToSwap<K, V> {
    space: String,
    max_memory: i64,
    swap: Option<Arc<SwapTier<K>>>,
    codec: EntryCodec<K, V>,
    ctx: Arc<StoreContext<K, V>>,
    first_evict_warned: AtomicBool,
    spilled: AtomicU64,
}

impl<K: Clone, V> SpillToSwap<K, V> {
    pub fn new(
        space: impl Into<String>,
        max_memory: i64,
        swap: Option<Arc<SwapTier<K>>>,
        ctx: Arc<StoreContext<K, V>>,
    ) -> Self {
        Self {
            space: space.into(),
            max_memory,
            swap,
            codec: EntryCodec::from_context(&ctx),
            ctx,
            first_evict_warned: AtomicBool::new(false),
            spilled: AtomicU64::new(0),
        }
    }

    /// Entries moved to swap so far.
    pub fn spilled(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    fn warn_first_evict(&self) {
        if self.first_evict_warned.load(Ordering::Acquire) {
            return;
        }
        if self
            .first_evict_warned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!(
                space = %self.space,
                offheap_max_memory = self.max_memory,
                "Off-heap evictions started, consider increasing offheap_max_memory"
            );
        }
    }

    fn spill(&self, swap: &SwapTier<K>, partition: u32, key_bytes: Bytes, value_bytes: Bytes) -> crate::error::Result<()> {
        let key = self.codec.unmarshal_key(&key_bytes)?;
        swap.write(&SwapKey::new(key.clone(), partition, key_bytes), value_bytes)?;
        self.ctx.record(EventKind::Swapped, partition, &key, true);
        Ok(())
    }
}

impl<K: Send + Sync, V: Send + Sync> EvictListener for SpillToSwap<K, V>
where
    K: Clone,
{
    fn on_evict(&self, partition: u32, key_hash: u32, key_bytes: Bytes, value_bytes: Bytes) {
        self.warn_first_evict();

        let Some(swap) = &self.swap else {
            debug!(space = %self.space, partition, key_hash, "Swap disabled, dropping evicted entry");
            return;
        };

        match self.spill(swap, partition, key_bytes, value_bytes) {
            Ok(()) => {
                self.spilled.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(space = %self.space, partition, key_hash, error = %e, "Failed to spill evicted entry to swap");
            }
        }
    }
}
