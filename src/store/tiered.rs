//! Tiered store: the facade over the off-heap and swap tiers.
//!
//! The store is the central coordinator for one cache's evicted entries. It:
//! - Decides once, at start, which tiers exist ([`TierSelection`])
//! - Writes every entry to exactly one tier, off-heap whenever it exists
//! - Reads and removes across tiers, off-heap first
//! - Notifies listeners, the event recorder and the query index on transitions
//! - Hands out closeable iterators and reclaims abandoned lazy ones
//!
//! Durability: with off-heap enabled, writes land only in the off-heap region
//! and reach swap only when the region evicts them. Off-heap contents do not
//! survive a restart.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::StoreConfig;
use crate::context::{CacheKey, CacheValue, EventKind, StoreContext};
use crate::engine::{EvictListener, OffHeapEngine, SwapEngine};
use crate::error::{Result, StoreError};
use crate::store::codec::EntryCodec;
use crate::store::entry::{BatchSwapEntry, CacheVersion, EntryEnvelope, LoaderId, RawEntry, SwapEntry, SwapKey, TierKind};
use crate::store::iter::{self, BoxedIter, CloseableIterator, DualTierIterator, TierIter, TierRemover};
use crate::store::listener::{ListenerRef, ListenerRegistry};
use crate::store::tier::{OffHeapTier, SpillToSwap, SwapTier};
use crate::store::tracker::{LazyIterator, WeakIteratorTracker};

/// Which tiers the store runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSelection {
    Neither,
    OffHeapOnly,
    SwapOnly,
    Both,
}

impl TierSelection {
    pub fn resolve(off_heap: bool, swap: bool) -> Self {
        match (off_heap, swap) {
            (false, false) => TierSelection::Neither,
            (true, false) => TierSelection::OffHeapOnly,
            (false, true) => TierSelection::SwapOnly,
            (true, true) => TierSelection::Both,
        }
    }

    pub fn off_heap(&self) -> bool {
        matches!(self, TierSelection::OffHeapOnly | TierSelection::Both)
    }

    pub fn swap(&self) -> bool {
        matches!(self, TierSelection::SwapOnly | TierSelection::Both)
    }

    pub fn any(&self) -> bool {
        *self != TierSelection::Neither
    }

    /// The tier a write lands in. Off-heap wins whenever it is enabled.
    pub fn write_tier(&self) -> Option<TierKind> {
        match self {
            TierSelection::Neither => None,
            TierSelection::OffHeapOnly | TierSelection::Both => Some(TierKind::OffHeap),
            TierSelection::SwapOnly => Some(TierKind::Swap),
        }
    }
}

/// The running tiers. Only the combinations [`TierSelection`] names exist.
enum Tiers<K> {
    Neither,
    OffHeapOnly(Arc<OffHeapTier>),
    SwapOnly(Arc<SwapTier<K>>),
    Both(Arc<OffHeapTier>, Arc<SwapTier<K>>),
}

impl<K> Tiers<K> {
    fn selection(&self) -> TierSelection {
        match self {
            Tiers::Neither => TierSelection::Neither,
            Tiers::OffHeapOnly(_) => TierSelection::OffHeapOnly,
            Tiers::SwapOnly(_) => TierSelection::SwapOnly,
            Tiers::Both(..) => TierSelection::Both,
        }
    }

    fn off_heap(&self) -> Option<&Arc<OffHeapTier>> {
        match self {
            Tiers::OffHeapOnly(off) | Tiers::Both(off, _) => Some(off),
            _ => None,
        }
    }

    fn swap(&self) -> Option<&Arc<SwapTier<K>>> {
        match self {
            Tiers::SwapOnly(swap) | Tiers::Both(_, swap) => Some(swap),
            _ => None,
        }
    }
}

enum WriteTarget<'a, K> {
    OffHeap(&'a OffHeapTier),
    Swap(&'a SwapTier<K>),
}

/// A decoded partition entry: key bytes and the materialized entry.
pub type PartitionEntry<V> = (Bytes, SwapEntry<V>);

/// Store counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub space: String,
    pub selection: TierSelection,
    pub off_heap_entries: u64,
    pub off_heap_allocated: u64,
    pub swap_size: i64,
    pub swap_keys: i64,
    pub spilled_to_swap: u64,
    pub tracked_iterators: usize,
}

/// Swap manager for one cache.
pub struct TieredStore<K, V> {
    space: String,
    enabled: bool,
    tiers: Tiers<K>,
    ctx: Arc<StoreContext<K, V>>,
    codec: Arc<EntryCodec<K, V>>,
    spill: Option<Arc<SpillToSwap<K, V>>>,
    swap_listeners: ListenerRegistry<K, V>,
    off_heap_listeners: ListenerRegistry<K, V>,
    iterators: WeakIteratorTracker<RawEntry>,
}

impl<K: CacheKey, V: CacheValue> TieredStore<K, V> {
    /// Resolve the tier selection and bring the tiers up.
    ///
    /// `swap_subsystem_enabled` is the node-wide swap switch; the store's own
    /// `swap_enabled` flag only narrows it.
    pub fn start(
        config: &StoreConfig,
        swap_subsystem_enabled: bool,
        ctx: StoreContext<K, V>,
        off_heap_engine: Arc<dyn OffHeapEngine>,
        swap_engine: Arc<dyn SwapEngine<K>>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = Arc::new(ctx);
        let codec = Arc::new(EntryCodec::from_context(&ctx));
        let space = config.space_name.clone();

        let swap_on = config.enabled && config.swap_enabled && swap_subsystem_enabled;
        let off_heap_on = config.offheap_tier_requested();

        let swap = swap_on.then(|| {
            Arc::new(SwapTier::new(
                swap_engine,
                space.clone(),
                ctx.deployment.global_loader(),
            ))
        });

        let mut spill = None;
        let off_heap = if off_heap_on {
            let listener = Arc::new(SpillToSwap::new(
                space.clone(),
                config.offheap_max_memory,
                swap.clone(),
                ctx.clone(),
            ));
            spill = Some(listener.clone());

            let evict: Arc<dyn EvictListener> = listener;
            Some(Arc::new(OffHeapTier::create(
                off_heap_engine,
                space.clone(),
                ctx.affinity.partitions(),
                config.offheap_init_size(),
                config.offheap_max_size(),
                Some(evict),
            )?))
        } else {
            None
        };

        let tiers = match (off_heap, swap) {
            (None, None) => Tiers::Neither,
            (Some(off), None) => Tiers::OffHeapOnly(off),
            (None, Some(swap)) => Tiers::SwapOnly(swap),
            (Some(off), Some(swap)) => Tiers::Both(off, swap),
        };

        info!(
            space = %space,
            selection = ?tiers.selection(),
            offheap_max_memory = config.offheap_max_memory,
            "Tiered store started"
        );

        Ok(Self {
            space,
            enabled: config.enabled,
            tiers,
            ctx,
            codec,
            spill,
            swap_listeners: ListenerRegistry::new("swap"),
            off_heap_listeners: ListenerRegistry::new("offheap"),
            iterators: WeakIteratorTracker::new(),
        })
    }

    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn selection(&self) -> TierSelection {
        self.tiers.selection()
    }

    pub fn swap_enabled(&self) -> bool {
        self.selection().swap()
    }

    pub fn off_heap_enabled(&self) -> bool {
        self.selection().off_heap()
    }

    pub fn codec(&self) -> &EntryCodec<K, V> {
        &self.codec
    }

    /// Number of lazy iterators still tracked.
    pub fn iterator_set_size(&self) -> usize {
        self.iterators.size()
    }

    fn partition(&self, key: &K) -> u32 {
        self.ctx.affinity.partition(key)
    }

    fn write_target(&self) -> Option<WriteTarget<'_, K>> {
        match self.selection().write_tier()? {
            TierKind::OffHeap => self.tiers.off_heap().map(|t| WriteTarget::OffHeap(t.as_ref())),
            TierKind::Swap => self.tiers.swap().map(|t| WriteTarget::Swap(t.as_ref())),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<SwapEntry<V>>> {
        Ok(self.codec.decode(bytes)?)
    }

    // ---- Reads ----

    pub fn contains_key(&self, key: &K, key_bytes: &[u8]) -> Result<bool> {
        if !self.selection().any() {
            return Ok(false);
        }
        self.iterators.drain();

        let part = self.partition(key);

        if let Some(off) = self.tiers.off_heap() {
            if off.contains(part, key_bytes)? {
                return Ok(true);
            }
        }

        match self.tiers.swap() {
            Some(swap) => {
                let swap_key = SwapKey::new(key.clone(), part, Bytes::copy_from_slice(key_bytes));
                Ok(swap.read(&swap_key)?.is_some())
            }
            None => Ok(false),
        }
    }

    /// Look an entry up without removing it, off-heap first.
    pub fn read(&self, key: &K, key_bytes: &[u8]) -> Result<Option<SwapEntry<V>>> {
        if !self.selection().any() {
            return Ok(None);
        }
        self.iterators.drain();

        let part = self.partition(key);

        if let Some(off) = self.tiers.off_heap() {
            if let Some(bytes) = off.get(part, key_bytes)? {
                return self.decode(&bytes);
            }
        }

        let Some(swap) = self.tiers.swap() else {
            return Ok(None);
        };

        let swap_key = SwapKey::new(key.clone(), part, Bytes::copy_from_slice(key_bytes));
        match swap.read(&swap_key)? {
            Some(bytes) => self.decode(&bytes),
            None => Ok(None),
        }
    }

    pub fn read_key(&self, key: &K) -> Result<Option<SwapEntry<V>>> {
        if !self.selection().any() {
            return Ok(None);
        }
        let key_bytes = self.codec.marshal_key(key)?;
        self.read(key, &key_bytes)
    }

    // ---- Removals ----

    /// Side effects of an entry leaving the off-heap tier.
    fn on_off_heap_removed(&self, part: u32, key: &K, key_bytes: &[u8], bytes: &[u8]) -> Result<Option<SwapEntry<V>>> {
        let Some(entry) = self.decode(bytes)? else {
            return Ok(None);
        };

        self.off_heap_listeners.notify(part, key, key_bytes, &entry);
        self.ctx.record(EventKind::FromOffHeap, part, key, true);
        if let Some(queries) = &self.ctx.queries {
            queries.on_unswap(key, &entry.value, &entry.envelope.value_bytes);
        }

        Ok(Some(entry))
    }

    /// Side effects of an entry leaving the swap tier.
    fn on_swap_removed(&self, key: &SwapKey<K>, bytes: Option<Bytes>) -> Result<Option<SwapEntry<V>>> {
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let Some(entry) = self.decode(&bytes)? else {
            return Ok(None);
        };

        self.ctx.record(EventKind::Unswapped, key.partition, &key.key, true);
        self.swap_listeners
            .notify(key.partition, &key.key, &key.key_bytes, &entry);
        if let Some(queries) = &self.ctx.queries {
            queries.on_unswap(&key.key, &entry.value, &entry.envelope.value_bytes);
        }

        Ok(Some(entry))
    }

    /// Remove one key from swap, collecting what the engine callback saw.
    fn swap_remove_one(&self, swap: &SwapTier<K>, key: &SwapKey<K>) -> Result<Option<SwapEntry<V>>> {
        let removed = Mutex::new(None);
        let failure = Mutex::new(None);

        swap.remove(key, &|k: &SwapKey<K>, bytes: Option<Bytes>| match self.on_swap_removed(k, bytes) {
            Ok(entry) => *removed.lock() = entry,
            Err(e) => *failure.lock() = Some(e),
        })?;

        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        Ok(removed.into_inner())
    }

    /// Remove an entry and return it, off-heap first.
    ///
    /// Listeners, the event recorder and the query index are notified before
    /// this returns.
    pub fn read_and_remove(&self, key: &K, key_bytes: &[u8]) -> Result<Option<SwapEntry<V>>> {
        if !self.selection().any() {
            return Ok(None);
        }
        self.iterators.drain();

        let part = self.partition(key);

        if let Some(off) = self.tiers.off_heap() {
            if let Some(bytes) = off.remove(part, key_bytes)? {
                return self.on_off_heap_removed(part, key, key_bytes, &bytes);
            }
        }

        let Some(swap) = self.tiers.swap() else {
            return Ok(None);
        };

        let swap_key = SwapKey::new(key.clone(), part, Bytes::copy_from_slice(key_bytes));
        self.swap_remove_one(swap, &swap_key)
    }

    pub fn read_and_remove_key(&self, key: &K) -> Result<Option<SwapEntry<V>>> {
        if !self.selection().any() {
            return Ok(None);
        }
        let key_bytes = self.codec.marshal_key(key)?;
        self.read_and_remove(key, &key_bytes)
    }

    /// Batch read-and-remove.
    ///
    /// Keys found off-heap are removed there first; the rest go to swap in a
    /// single batch. Misses are skipped. A swap failure is returned after the
    /// off-heap removals have already happened.
    pub fn read_and_remove_all(&self, keys: &[K]) -> Result<Vec<BatchSwapEntry<K, V>>> {
        if !self.selection().any() {
            return Ok(Vec::new());
        }
        self.iterators.drain();

        let mut remaining = Vec::with_capacity(keys.len());
        for key in keys {
            let key_bytes = self.codec.marshal_key(key)?;
            remaining.push(SwapKey::new(key.clone(), self.partition(key), key_bytes));
        }

        let mut out = Vec::with_capacity(keys.len());

        if let Some(off) = self.tiers.off_heap() {
            let mut rest = Vec::with_capacity(remaining.len());
            for k in remaining {
                let removed = match off.remove(k.partition, &k.key_bytes)? {
                    Some(bytes) => self.on_off_heap_removed(k.partition, &k.key, &k.key_bytes, &bytes)?,
                    None => None,
                };
                match removed {
                    Some(entry) => out.push(BatchSwapEntry::unswapped(k.key, k.key_bytes, k.partition, entry)),
                    None => rest.push(k),
                }
            }
            remaining = rest;
        }

        let Some(swap) = self.tiers.swap() else {
            return Ok(out);
        };
        if remaining.is_empty() {
            return Ok(out);
        }

        let collected = Mutex::new(Vec::new());
        let failure = Mutex::new(None);

        swap.remove_all(&remaining, &|k: &SwapKey<K>, bytes: Option<Bytes>| {
            match self.on_swap_removed(k, bytes) {
                Ok(Some(entry)) => collected.lock().push(BatchSwapEntry::unswapped(
                    k.key.clone(),
                    k.key_bytes.clone(),
                    k.partition,
                    entry,
                )),
                Ok(None) => {}
                Err(e) => {
                    failure.lock().get_or_insert(e);
                }
            }
        })?;

        if let Some(e) = failure.into_inner() {
            return Err(e);
        }

        out.extend(collected.into_inner());
        Ok(out)
    }

    /// Remove an entry without returning it.
    ///
    /// The query index still learns about the removed value.
    pub fn remove(&self, key: &K, key_bytes: &[u8]) -> Result<()> {
        if !self.selection().any() {
            return Ok(());
        }
        self.iterators.drain();

        let part = self.partition(key);

        if let Some(off) = self.tiers.off_heap() {
            if let Some(bytes) = off.remove(part, key_bytes)? {
                if let Some(queries) = &self.ctx.queries {
                    if let Some(entry) = self.decode(&bytes)? {
                        queries.on_unswap(key, &entry.value, &entry.envelope.value_bytes);
                    }
                }
                return Ok(());
            }
        }

        let Some(swap) = self.tiers.swap() else {
            return Ok(());
        };

        let swap_key = SwapKey::new(key.clone(), part, Bytes::copy_from_slice(key_bytes));
        let failure = Mutex::new(None);

        swap.remove(&swap_key, &|k: &SwapKey<K>, bytes: Option<Bytes>| {
            let (Some(queries), Some(bytes)) = (&self.ctx.queries, bytes) else {
                return;
            };
            match self.decode(&bytes) {
                Ok(Some(entry)) => queries.on_unswap(&k.key, &entry.value, &entry.envelope.value_bytes),
                Ok(None) => {}
                Err(e) => *failure.lock() = Some(e),
            }
        })?;

        match failure.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- Writes ----

    /// Write an entry to exactly one tier.
    pub fn write(&self, key: &K, key_bytes: impl Into<Bytes>, envelope: &EntryEnvelope) -> Result<()> {
        let Some(target) = self.write_target() else {
            return Ok(());
        };
        self.iterators.drain();

        let part = self.partition(key);
        let key_bytes = key_bytes.into();
        let encoded = self.codec.encode(envelope)?;

        match target {
            WriteTarget::OffHeap(off) => {
                off.put(part, envelope.key_hash, key_bytes, encoded)?;
                self.ctx.record(EventKind::ToOffHeap, part, key, true);
            }
            WriteTarget::Swap(swap) => {
                swap.write(&SwapKey::new(key.clone(), part, key_bytes), encoded)?;
                self.ctx.record(EventKind::Swapped, part, key, true);
            }
        }

        if let Some(queries) = &self.ctx.queries {
            queries.on_swap(&self.space, key);
        }
        Ok(())
    }

    /// Marshal `key` and `value` and write them.
    pub fn write_value(&self, key: &K, value: &V, version: CacheVersion) -> Result<()> {
        if self.write_target().is_none() {
            return Ok(());
        }
        let key_bytes = self.codec.marshal_key(key)?;
        let envelope = self.codec.envelope_for(&key_bytes, value, version)?;
        self.write(key, key_bytes, &envelope)
    }

    /// Write a batch. Off-heap takes entries one by one; swap takes the whole
    /// batch in one engine call.
    pub fn write_all(&self, batch: &[BatchSwapEntry<K, V>]) -> Result<()> {
        let Some(target) = self.write_target() else {
            return Ok(());
        };
        self.iterators.drain();

        match target {
            WriteTarget::OffHeap(off) => {
                for entry in batch {
                    off.put(
                        entry.partition,
                        entry.key_hash(),
                        entry.key_bytes.clone(),
                        self.codec.encode(&entry.envelope)?,
                    )?;
                    self.ctx
                        .record(EventKind::ToOffHeap, entry.partition, &entry.key, true);
                    if let Some(queries) = &self.ctx.queries {
                        queries.on_swap(&self.space, &entry.key);
                    }
                }
            }
            WriteTarget::Swap(swap) => {
                let encoded = batch
                    .iter()
                    .map(|entry| Ok((entry.swap_key(), self.codec.encode(&entry.envelope)?)))
                    .collect::<Result<Vec<_>>>()?;
                swap.write_all(&encoded)?;

                for entry in batch {
                    self.ctx
                        .record(EventKind::Swapped, entry.partition, &entry.key, true);
                    if let Some(queries) = &self.ctx.queries {
                        queries.on_swap(&self.space, &entry.key);
                    }
                }
            }
        }

        debug!(space = %self.space, count = batch.len(), "Wrote batch");
        Ok(())
    }

    // ---- Iteration ----

    fn decoded(&self, raw: BoxedIter<RawEntry>) -> BoxedIter<PartitionEntry<V>> {
        Box::new(DecodedEntries {
            inner: raw,
            codec: self.codec.clone(),
        })
    }

    /// Decoded entries of one partition across both tiers, off-heap first.
    ///
    /// `None` when no tier is enabled. Removal is not supported.
    pub fn iterator(&self, partition: u32) -> Result<Option<BoxedIter<PartitionEntry<V>>>> {
        self.iterators.drain();

        let raw: BoxedIter<RawEntry> = match &self.tiers {
            Tiers::Neither => return Ok(None),
            Tiers::OffHeapOnly(off) => off.partition_iterator(partition)?,
            Tiers::SwapOnly(swap) => swap.partition_iterator(partition)?,
            Tiers::Both(off, swap) => {
                let swap = swap.clone();
                Box::new(DualTierIterator::new(
                    off.partition_iterator(partition)?,
                    Box::new(move || swap.partition_iterator(partition).map_err(StoreError::from)),
                )?)
            }
        };

        Ok(Some(self.decoded(raw)))
    }

    /// Decoded entries of one partition in the off-heap tier.
    pub fn off_heap_iterator(&self, partition: u32) -> Result<Option<BoxedIter<PartitionEntry<V>>>> {
        let Some(off) = self.tiers.off_heap() else {
            return Ok(None);
        };
        self.iterators.drain();
        Ok(Some(self.decoded(off.partition_iterator(partition)?)))
    }

    /// Decoded entries of one partition in the swap tier.
    pub fn swap_iterator(&self, partition: u32) -> Result<Option<BoxedIter<PartitionEntry<V>>>> {
        let Some(swap) = self.tiers.swap() else {
            return Ok(None);
        };
        self.iterators.drain();
        Ok(Some(self.decoded(swap.partition_iterator(partition)?)))
    }

    /// Removes an element from the tier that produced it, at the partition
    /// the tier reported. The key is never decoded.
    fn tier_remover(&self) -> TierRemover<RawEntry> {
        let off_heap = self.tiers.off_heap().cloned();
        let swap = self.tiers.swap().cloned();

        Box::new(move |tier: TierKind, raw: &RawEntry| -> Result<()> {
            match (tier, &off_heap, &swap) {
                (TierKind::OffHeap, Some(off), _) => {
                    off.delete(raw.partition, &raw.key_bytes)?;
                }
                (TierKind::Swap, _, Some(swap)) => {
                    swap.delete(raw.partition, &raw.key_bytes)?;
                }
                _ => return Err(StoreError::IllegalState("element from a disabled tier")),
            }
            Ok(())
        })
    }

    /// Raw entries of the whole store, off-heap first. Supports removal.
    pub fn raw_iterator(&self) -> Result<BoxedIter<RawEntry>> {
        self.iterators.drain();

        let iter: BoxedIter<RawEntry> = match &self.tiers {
            Tiers::Neither => iter::empty(),
            Tiers::OffHeapOnly(off) => Box::new(TierIter::new(off.iterator()?, TierKind::OffHeap, self.tier_remover())),
            Tiers::SwapOnly(swap) => Box::new(TierIter::new(swap.raw_iterator()?, TierKind::Swap, self.tier_remover())),
            Tiers::Both(off, swap) => {
                let swap = swap.clone();
                Box::new(
                    DualTierIterator::new(off.iterator()?, Box::new(move || swap.raw_iterator().map_err(StoreError::from)))?
                        .with_remover(self.tier_remover()),
                )
            }
        };
        Ok(iter)
    }

    fn lazy(&self, raw: BoxedIter<RawEntry>) -> LazyIterator<K, V> {
        LazyIterator::new(
            self.iterators.register(raw),
            self.codec.clone(),
            self.ctx.cache.clone(),
        )
    }

    /// Lazily decoding iterator over the whole swap space.
    ///
    /// A dropped, unclosed iterator is closed by a later store operation.
    pub fn lazy_swap_iterator(&self) -> Result<LazyIterator<K, V>> {
        self.iterators.drain();
        let raw = match self.tiers.swap() {
            Some(swap) => swap.raw_iterator()?,
            None => iter::empty(),
        };
        Ok(self.lazy(raw))
    }

    /// Lazily decoding iterator over the whole off-heap space.
    pub fn lazy_off_heap_iterator(&self) -> Result<LazyIterator<K, V>> {
        self.iterators.drain();
        let raw = match self.tiers.off_heap() {
            Some(off) => off.iterator()?,
            None => iter::empty(),
        };
        Ok(self.lazy(raw))
    }

    // ---- Undeploy ----

    fn owned_by(&self, raw: &RawEntry, loader: LoaderId) -> Result<bool> {
        let envelope = self.codec.decode_envelope(&raw.value_bytes)?;
        if envelope.key_loader == Some(loader) {
            return Ok(true);
        }
        Ok(self.codec.value_loader_of(&envelope)? == Some(loader))
    }

    /// Drop every entry whose key or value belongs to `loader`.
    ///
    /// Returns the number removed. Entries that fail to decode or remove are
    /// logged and skipped.
    pub fn on_undeploy(&self, loader: LoaderId) -> usize {
        self.iterators.drain();

        let mut iter = match self.raw_iterator() {
            Ok(iter) => iter,
            Err(e) => {
                error!(space = %self.space, loader = %loader, error = %e, "Failed to clear swap for undeployed loader");
                return 0;
            }
        };

        let mut removed = 0;
        while let Some(item) = iter.next() {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    error!(space = %self.space, error = %e, "Failed to read entry during undeploy");
                    continue;
                }
            };

            match self.owned_by(&raw, loader) {
                Ok(true) => match iter.remove() {
                    Ok(()) => removed += 1,
                    Err(e) => error!(space = %self.space, error = %e, "Failed to remove undeployed entry"),
                },
                Ok(false) => {}
                Err(e) => error!(space = %self.space, error = %e, "Failed to inspect entry during undeploy"),
            }
        }

        if let Err(e) = iter.close() {
            error!(space = %self.space, error = %e, "Failed to close undeploy iterator");
        }

        if removed > 0 {
            info!(space = %self.space, loader = %loader, count = removed, "Removed swapped entries of undeployed loader");
        }
        removed
    }

    // ---- Maintenance and counters ----

    pub fn clear_off_heap(&self) -> Result<()> {
        self.iterators.drain();
        if let Some(off) = self.tiers.off_heap() {
            off.clear()?;
        }
        Ok(())
    }

    pub fn clear_swap(&self) -> Result<()> {
        self.iterators.drain();
        if let Some(swap) = self.tiers.swap() {
            swap.clear()?;
        }
        Ok(())
    }

    pub fn off_heap_entries_count(&self) -> u64 {
        self.tiers.off_heap().map_or(0, |off| off.entries_count())
    }

    pub fn off_heap_allocated_size(&self) -> u64 {
        self.tiers.off_heap().map_or(0, |off| off.allocated_size())
    }

    /// Swap bytes: -1 when the store is disabled, 0 when swap is.
    pub fn swap_size(&self) -> Result<i64> {
        if !self.enabled {
            return Ok(-1);
        }
        match self.tiers.swap() {
            Some(swap) => Ok(swap.size()? as i64),
            None => Ok(0),
        }
    }

    /// Swap keys: -1 when the store is disabled, 0 when swap is.
    pub fn swap_keys(&self) -> Result<i64> {
        if !self.enabled {
            return Ok(-1);
        }
        match self.tiers.swap() {
            Some(swap) => Ok(swap.count()? as i64),
            None => Ok(0),
        }
    }

    /// Off-heap victims written to swap so far.
    pub fn spilled_to_swap(&self) -> u64 {
        self.spill.as_ref().map_or(0, |s| s.spilled())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            space: self.space.clone(),
            selection: self.selection(),
            off_heap_entries: self.off_heap_entries_count(),
            off_heap_allocated: self.off_heap_allocated_size(),
            swap_size: self.swap_size()?,
            swap_keys: self.swap_keys()?,
            spilled_to_swap: self.spilled_to_swap(),
            tracked_iterators: self.iterator_set_size(),
        })
    }

    // ---- Listeners ----

    pub fn add_swap_listener(&self, partition: u32, listener: ListenerRef<K, V>) {
        self.swap_listeners.add_listener(partition, listener);
    }

    pub fn remove_swap_listener(&self, partition: u32, listener: &ListenerRef<K, V>) -> bool {
        self.swap_listeners.remove_listener(partition, listener)
    }

    pub fn add_off_heap_listener(&self, partition: u32, listener: ListenerRef<K, V>) {
        self.off_heap_listeners.add_listener(partition, listener);
    }

    pub fn remove_off_heap_listener(&self, partition: u32, listener: &ListenerRef<K, V>) -> bool {
        self.off_heap_listeners.remove_listener(partition, listener)
    }
}

/// Raw tier entries decoded on the fly. Entries whose loader is gone are
/// skipped.
struct DecodedEntries<K, V> {
    inner: BoxedIter<RawEntry>,
    codec: Arc<EntryCodec<K, V>>,
}

impl<K, V> Iterator for DecodedEntries<K, V> {
    type Item = Result<PartitionEntry<V>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.inner.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };
            match self.codec.decode(&raw.value_bytes) {
                Ok(Some(entry)) => return Some(Ok((raw.key_bytes, entry))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl<K: Send + Sync, V: Send + Sync> CloseableIterator<PartitionEntry<V>> for DecodedEntries<K, V> {
    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
