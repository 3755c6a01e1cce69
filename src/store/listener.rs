//! Per-partition listener registry.
//!
//! Listeners are told when an entry leaves a tier through a read-and-remove.
//! Membership is by instance identity: registering two equal-looking
//! listeners keeps both, registering the same `Arc` twice keeps one.
//!
//! Each partition maps to its own set with its own lock. A set that became
//! empty is retired: nobody adds to it again, and whoever finds it unlinks it
//! (if it is still the mapped one) and installs a fresh set instead.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::store::entry::SwapEntry;

/// Observer of entries unswapped from a tier.
pub trait SwapListener<K, V>: Send + Sync {
    fn on_entry_unswapped(&self, partition: u32, key: &K, key_bytes: &[u8], entry: &SwapEntry<V>);
}

pub type ListenerRef<K, V> = Arc<dyn SwapListener<K, V>>;

fn same_listener<K, V>(a: &ListenerRef<K, V>, b: &ListenerRef<K, V>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

struct ListenerSet<K, V> {
    listeners: Mutex<Vec<ListenerRef<K, V>>>,
}

/// Concurrent `partition -> listeners` table.
pub struct ListenerRegistry<K, V> {
    name: &'static str,
    sets: DashMap<u32, Arc<ListenerSet<K, V>>>,
}

impl<K, V> ListenerRegistry<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sets: DashMap::new(),
        }
    }

    pub fn add_listener(&self, partition: u32, listener: ListenerRef<K, V>) {
        loop {
            // Clone out so no shard lock is held while taking the set's lock.
            let existing = self.sets.get(&partition).map(|set| set.clone());

            match existing {
                Some(set) => {
                    {
                        let mut listeners = set.listeners.lock();
                        if !listeners.is_empty() {
                            if !listeners.iter().any(|l| same_listener(l, &listener)) {
                                listeners.push(listener);
                            }
                            return;
                        }
                    }

                    // Retired by a concurrent remove.
                    self.sets
                        .remove_if(&partition, |_, current| Arc::ptr_eq(current, &set));
                }
                None => {
                    let fresh = Arc::new(ListenerSet {
                        listeners: Mutex::new(vec![listener.clone()]),
                    });

                    match self.sets.entry(partition) {
                        Entry::Vacant(slot) => {
                            slot.insert(fresh);
                            return;
                        }
                        Entry::Occupied(_) => continue,
                    }
                }
            }
        }
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, partition: u32, listener: &ListenerRef<K, V>) -> bool {
        let set = match self.sets.get(&partition) {
            Some(set) => set.clone(),
            None => return false,
        };

        let (removed, empty) = {
            let mut listeners = set.listeners.lock();
            let before = listeners.len();
            listeners.retain(|l| !same_listener(l, listener));
            (listeners.len() != before, listeners.is_empty())
        };

        if empty {
            self.sets
                .remove_if(&partition, |_, current| Arc::ptr_eq(current, &set));
        }

        removed
    }

    /// Deliver an unswap notification to every listener on `partition`.
    ///
    /// Listeners run on the calling thread, outside the set's lock.
    pub fn notify(&self, partition: u32, key: &K, key_bytes: &[u8], entry: &SwapEntry<V>) {
        let snapshot = match self.sets.get(&partition) {
            Some(set) => set.listeners.lock().clone(),
            None => {
                trace!(registry = self.name, partition, "No listeners, skipping notification");
                return;
            }
        };

        for listener in &snapshot {
            listener.on_entry_unswapped(partition, key, key_bytes, entry);
        }
    }

    pub fn listener_count(&self, partition: u32) -> usize {
        self.sets
            .get(&partition)
            .map(|set| set.listeners.lock().len())
            .unwrap_or(0)
    }

    /// Partitions with a live listener set.
    pub fn partitions(&self) -> usize {
        self.sets.len()
    }
}
