//! In-process off-heap region.
//!
//! Each space is split into per-partition maps guarded by their own locks.
//! Byte usage is tracked per space; a write that pushes a bounded space over
//! its budget evicts least-recently-used entries from any partition and hands
//! them to the space's [`EvictListener`] after all region locks are released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::EvictionConfig;
use crate::engine::evictor::Evictor;
use crate::engine::{EngineError, EvictListener, OffHeapEngine};
use crate::store::entry::RawEntry;
use crate::store::iter::{BoxedIter, VecIter};

#[derive(Debug)]
struct Slot {
    value: Bytes,
    key_hash: u32,
    last_access: u64,
}

fn slot_size(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

/// A single named space inside the region.
struct RegionSpace {
    name: String,
    partitions: Vec<Mutex<HashMap<Bytes, Slot>>>,
    max_size: u64,
    allocated: AtomicU64,
    entries: AtomicU64,
    listener: Option<Arc<dyn EvictListener>>,
}

impl RegionSpace {
    fn partition(&self, partition: u32) -> Result<&Mutex<HashMap<Bytes, Slot>>, EngineError> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| EngineError::InvalidPartition {
                space: self.name.clone(),
                partition,
            })
    }

    fn on_removed(&self, key: &[u8], slot: &Slot) {
        self.allocated
            .fetch_sub(slot_size(key, &slot.value), Ordering::Relaxed);
        self.entries.fetch_sub(1, Ordering::Relaxed);
    }

    fn snapshot(&self, partition: Option<u32>) -> Result<Vec<RawEntry>, EngineError> {
        let mut out = Vec::new();
        let parts: Vec<(u32, &Mutex<HashMap<Bytes, Slot>>)> = match partition {
            Some(p) => vec![(p, self.partition(p)?)],
            None => (0u32..).zip(self.partitions.iter()).collect(),
        };
        for (p, part) in parts {
            let map = part.lock();
            out.extend(
                map.iter()
                    .map(|(k, slot)| RawEntry::new(p, k.clone(), slot.value.clone())),
            );
        }
        Ok(out)
    }
}

/// Multi-space in-process region.
pub struct MemoryRegion {
    spaces: RwLock<HashMap<String, Arc<RegionSpace>>>,
    evictor: Evictor,
    clock: AtomicU64,
    evictions: AtomicU64,
    open_iterators: Arc<AtomicUsize>,
}

impl MemoryRegion {
    pub fn new(eviction: EvictionConfig) -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
            evictor: Evictor::new(eviction),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            open_iterators: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn space(&self, name: &str) -> Result<Arc<RegionSpace>, EngineError> {
        self.spaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::SpaceNotFound(name.to_string()))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of iterators handed out and not yet closed or dropped.
    pub fn open_iterators(&self) -> usize {
        self.open_iterators.load(Ordering::SeqCst)
    }

    /// Total entries evicted since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn iter_over(&self, entries: Vec<RawEntry>) -> BoxedIter<RawEntry> {
        self.open_iterators.fetch_add(1, Ordering::SeqCst);
        let open = self.open_iterators.clone();
        Box::new(VecIter::new(entries).on_close(move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    /// Push the space back under budget, sparing the entry just written.
    fn evict(&self, space: &RegionSpace, partition: u32, key: &[u8]) {
        let allocated = space.allocated.load(Ordering::Relaxed);
        let excess = allocated.saturating_sub(space.max_size);
        if excess == 0 {
            return;
        }

        let now = self.clock.load(Ordering::Relaxed);
        let mut candidates = Vec::new();
        for (p, part) in space.partitions.iter().enumerate() {
            let map = part.lock();
            candidates.extend(map.iter().map(|(k, slot)| {
                (p as u32, k.clone(), slot.last_access, slot_size(k, &slot.value))
            }));
        }

        let victims = self
            .evictor
            .select_victims(candidates, excess, now, &[(partition, key)]);

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in victims {
            let mut map = space.partitions[victim.partition as usize].lock();
            if let Some(slot) = map.remove(&victim.key_bytes) {
                space.on_removed(&victim.key_bytes, &slot);
                evicted.push((victim.partition, slot.key_hash, victim.key_bytes, slot.value));
            }
        }

        if evicted.is_empty() {
            debug!(
                space = %space.name,
                allocated,
                max_size = space.max_size,
                "Region over budget with nothing evictable"
            );
            return;
        }

        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        debug!(space = %space.name, count = evicted.len(), "Evicted region entries");

        if let Some(listener) = &space.listener {
            for (part, hash, k, v) in evicted {
                listener.on_evict(part, hash, k, v);
            }
        }
    }
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self::new(EvictionConfig::default())
    }
}

impl OffHeapEngine for MemoryRegion {
    fn create(
        &self,
        space: &str,
        partitions: u32,
        init_size: u64,
        max_size: u64,
        listener: Option<Arc<dyn EvictListener>>,
    ) -> Result<(), EngineError> {
        let region_space = RegionSpace {
            name: space.to_string(),
            partitions: (0..partitions.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            max_size,
            allocated: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            listener,
        };

        let replaced = self
            .spaces
            .write()
            .insert(space.to_string(), Arc::new(region_space))
            .is_some();

        debug!(space, partitions, init_size, max_size, replaced, "Created off-heap space");
        Ok(())
    }

    fn destroy(&self, space: &str) -> bool {
        self.spaces.write().remove(space).is_some()
    }

    fn contains(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        let space = self.space(space)?;
        let map = space.partition(partition)?.lock();
        Ok(map.contains_key(key_bytes))
    }

    fn get(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError> {
        let space = self.space(space)?;
        let tick = self.tick();
        let mut map = space.partition(partition)?.lock();
        Ok(map.get_mut(key_bytes).map(|slot| {
            slot.last_access = tick;
            slot.value.clone()
        }))
    }

    fn put(
        &self,
        space: &str,
        partition: u32,
        key_hash: u32,
        key_bytes: Bytes,
        value_bytes: Bytes,
    ) -> Result<(), EngineError> {
        let space = self.space(space)?;
        let size = slot_size(&key_bytes, &value_bytes);
        let slot = Slot {
            value: value_bytes,
            key_hash,
            last_access: self.tick(),
        };

        let allocated = {
            let mut map = space.partition(partition)?.lock();
            let mut allocated = space.allocated.fetch_add(size, Ordering::Relaxed) + size;
            match map.insert(key_bytes.clone(), slot) {
                Some(old) => {
                    let old_size = slot_size(&key_bytes, &old.value);
                    space.allocated.fetch_sub(old_size, Ordering::Relaxed);
                    allocated -= old_size;
                }
                None => {
                    space.entries.fetch_add(1, Ordering::Relaxed);
                }
            }
            allocated
        };

        if space.max_size > 0 && allocated > space.max_size {
            self.evict(&space, partition, &key_bytes);
        }
        Ok(())
    }

    fn remove(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<Option<Bytes>, EngineError> {
        let space = self.space(space)?;
        let mut map = space.partition(partition)?.lock();
        Ok(map.remove(key_bytes).map(|slot| {
            space.on_removed(key_bytes, &slot);
            slot.value
        }))
    }

    fn delete(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        Ok(self.remove(space, partition, key_bytes)?.is_some())
    }

    fn iterator(&self, space: &str) -> Result<BoxedIter<RawEntry>, EngineError> {
        let entries = self.space(space)?.snapshot(None)?;
        Ok(self.iter_over(entries))
    }

    fn partition_iterator(&self, space: &str, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError> {
        let entries = self.space(space)?.snapshot(Some(partition))?;
        Ok(self.iter_over(entries))
    }

    fn entries_count(&self, space: &str) -> u64 {
        self.space(space)
            .map(|s| s.entries.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn allocated_size(&self, space: &str) -> u64 {
        self.space(space)
            .map(|s| s.allocated.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
