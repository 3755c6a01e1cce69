//! Integration tests for unswap listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use tiered_swap::config::StoreConfig;
use tiered_swap::context::{Affinity, StoreContext};
use tiered_swap::engine::region::MemoryRegion;
use tiered_swap::engine::swap_file::FileSwapSpace;
use tiered_swap::store::entry::{CacheVersion, SwapEntry};
use tiered_swap::store::listener::{ListenerRef, SwapListener};
use tiered_swap::TieredStore;

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

impl SwapListener<String, String> for Counting {
    fn on_entry_unswapped(&self, _partition: u32, key: &String, _key_bytes: &[u8], entry: &SwapEntry<String>) {
        assert_eq!(entry.value.as_object(), Some(key));
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn store(tmp: &TempDir, offheap_max_memory: i64) -> TieredStore<String, String> {
    let config = StoreConfig {
        offheap_max_memory,
        partitions: 8,
        ..Default::default()
    };
    TieredStore::start(
        &config,
        true,
        StoreContext::standalone(8),
        Arc::new(MemoryRegion::default()),
        Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap()),
    )
    .unwrap()
}

fn partition_of(key: &str) -> u32 {
    let affinity = tiered_swap::context::HashAffinity::new(8);
    Affinity::<String>::partition(&affinity, &key.to_string())
}

#[test]
fn test_each_listener_notified_once_per_unswap() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(store(&tmp, -1));

    let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();
    let target = partition_of(&keys[0]);
    let on_target: Vec<&String> = keys.iter().filter(|k| partition_of(k) == target).collect();

    let listeners: Vec<Arc<Counting>> = (0..4).map(|_| Arc::new(Counting::default())).collect();
    for l in &listeners {
        store.add_swap_listener(target, l.clone());
    }

    for k in &keys {
        store.write_value(k, k, CacheVersion::default()).unwrap();
    }

    std::thread::scope(|scope| {
        // Unrelated churn on the other partitions.
        for t in 0..3u32 {
            let store = store.clone();
            scope.spawn(move || {
                for i in 0..300u32 {
                    let part = (target + 1 + (t + i) % 7) % 8;
                    let l: ListenerRef<String, String> = Arc::new(Counting::default());
                    store.add_swap_listener(part, l.clone());
                    store.remove_swap_listener(part, &l);
                }
            });
        }

        for k in &on_target {
            assert!(store.read_and_remove_key(k).unwrap().is_some());
        }
    });

    for l in &listeners {
        assert_eq!(l.calls.load(Ordering::SeqCst), on_target.len());
    }
}

#[test]
fn test_off_heap_and_swap_registries_are_separate() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, 0);
    let key = "k".to_string();
    let part = partition_of(&key);

    let off_heap = Arc::new(Counting::default());
    let swap = Arc::new(Counting::default());
    store.add_off_heap_listener(part, off_heap.clone());
    store.add_swap_listener(part, swap.clone());

    store.write_value(&key, &key, CacheVersion::default()).unwrap();
    store.read_and_remove_key(&key).unwrap();

    assert_eq!(off_heap.calls.load(Ordering::SeqCst), 1);
    assert_eq!(swap.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_removed_listener_is_silent() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, -1);
    let key = "k".to_string();
    let part = partition_of(&key);

    let listener = Arc::new(Counting::default());
    let as_ref: ListenerRef<String, String> = listener.clone();
    store.add_swap_listener(part, as_ref.clone());
    assert!(store.remove_swap_listener(part, &as_ref));

    store.write_value(&key, &key, CacheVersion::default()).unwrap();
    store.read_and_remove_key(&key).unwrap();
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}
