//! Reclamation of abandoned lazy iterators.
//!
//! A lazy iterator handed to a caller wraps an engine iterator that pins
//! engine resources. The handle owns a liveness token; the tracker keeps only
//! a weak reference to that token plus a strong reference to the engine
//! iterator. When a caller drops the handle without closing it, the token dies
//! and the next [`WeakIteratorTracker::drain`] closes the engine iterator.
//!
//! Dropping a handle never closes anything by itself. Close explicitly to
//! release resources immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::context::CacheRemover;
use crate::error::{Result, StoreError};
use crate::store::codec::EntryCodec;
use crate::store::entry::{RawEntry, SwapEntry};
use crate::store::iter::{BoxedIter, CloseableIterator};

type SharedIter<T> = Arc<Mutex<BoxedIter<T>>>;

struct Tracked<T> {
    liveness: Weak<()>,
    iter: SharedIter<T>,
}

type Registry<T> = Arc<Mutex<HashMap<u64, Tracked<T>>>>;

/// Registry of live lazy iterators.
pub struct WeakIteratorTracker<T> {
    entries: Registry<T>,
    next_id: AtomicU64,
}

impl<T: Send + 'static> WeakIteratorTracker<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start tracking `iter` and return the caller's handle to it.
    pub fn register(&self, iter: BoxedIter<T>) -> TrackedIter<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let liveness = Arc::new(());
        let iter = Arc::new(Mutex::new(iter));

        self.entries.lock().insert(
            id,
            Tracked {
                liveness: Arc::downgrade(&liveness),
                iter: iter.clone(),
            },
        );

        TrackedIter {
            id,
            _liveness: liveness,
            iter,
            registry: self.entries.clone(),
            closed: false,
        }
    }

    /// Close and forget every iterator whose handle has been dropped.
    ///
    /// Returns the number reclaimed. Close failures are logged.
    pub fn drain(&self) -> usize {
        let abandoned: Vec<SharedIter<T>> = {
            let mut entries = self.entries.lock();
            let dead: Vec<u64> = entries
                .iter()
                .filter(|(_, t)| t.liveness.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            dead.iter()
                .filter_map(|id| entries.remove(id))
                .map(|t| t.iter)
                .collect()
        };

        for iter in &abandoned {
            if let Err(e) = iter.lock().close() {
                error!(error = %e, "Failed to close abandoned iterator");
            }
        }

        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "Reclaimed abandoned iterators");
        }
        abandoned.len()
    }

    /// Number of iterators currently tracked.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<T: Send + 'static> Default for WeakIteratorTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side handle to a tracked iterator.
pub struct TrackedIter<T> {
    id: u64,
    _liveness: Arc<()>,
    iter: SharedIter<T>,
    registry: Registry<T>,
    closed: bool,
}

impl<T> Iterator for TrackedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.iter.lock().next()
    }
}

impl<T: Send> CloseableIterator<T> for TrackedIter<T> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.registry.lock().remove(&self.id);
        self.iter.lock().close()
    }
}

/// An entry from a lazy iterator. Key and value are decoded on access.
pub struct LazyEntry<K, V> {
    raw: RawEntry,
    codec: Arc<EntryCodec<K, V>>,
}

impl<K, V> LazyEntry<K, V> {
    pub fn key_bytes(&self) -> &[u8] {
        &self.raw.key_bytes
    }

    pub fn key(&self) -> Result<K> {
        Ok(self.codec.unmarshal_key(&self.raw.key_bytes)?)
    }

    /// The decoded entry, or `None` if its value loader is gone.
    pub fn entry(&self) -> Result<Option<SwapEntry<V>>> {
        Ok(self.codec.decode(&self.raw.value_bytes)?)
    }

    pub fn value(&self) -> Result<Option<V>> {
        Ok(self.entry()?.and_then(|e| e.value.into_object()))
    }
}

/// Engine-global iterator decoding entries lazily. Removal goes through the
/// owning cache.
pub struct LazyIterator<K, V> {
    inner: TrackedIter<RawEntry>,
    codec: Arc<EntryCodec<K, V>>,
    cache: Option<Arc<dyn CacheRemover<K>>>,
    last: Option<RawEntry>,
}

impl<K, V> LazyIterator<K, V> {
    pub(crate) fn new(
        inner: TrackedIter<RawEntry>,
        codec: Arc<EntryCodec<K, V>>,
        cache: Option<Arc<dyn CacheRemover<K>>>,
    ) -> Self {
        Self {
            inner,
            codec,
            cache,
            last: None,
        }
    }
}

impl<K, V> Iterator for LazyIterator<K, V> {
    type Item = Result<LazyEntry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(raw) => {
                self.last = Some(raw.clone());
                Some(Ok(LazyEntry {
                    raw,
                    codec: self.codec.clone(),
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl<K: Send + Sync, V: Send + Sync> CloseableIterator<LazyEntry<K, V>> for LazyIterator<K, V> {
    fn close(&mut self) -> Result<()> {
        self.last = None;
        self.inner.close()
    }

    fn remove(&mut self) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(StoreError::Unsupported("remove without an owning cache"))?;
        let raw = self
            .last
            .take()
            .ok_or(StoreError::IllegalState("next() not called or element already removed"))?;

        let key = self.codec.unmarshal_key(&raw.key_bytes)?;
        cache.remove(&key)
    }
}
