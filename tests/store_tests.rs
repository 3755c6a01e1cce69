//! Integration tests for the tiered store facade.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use tiered_swap::config::{EvictionConfig, StoreConfig};
use tiered_swap::context::{Affinity, HashAffinity, QueryIndex, StoreContext};
use tiered_swap::engine::region::MemoryRegion;
use tiered_swap::engine::swap_file::FileSwapSpace;
use tiered_swap::store::entry::{BatchSwapEntry, CacheVersion, EntryEnvelope, SwapValue};
use tiered_swap::{TierSelection, TieredStore};

fn config(offheap_max_memory: i64) -> StoreConfig {
    StoreConfig {
        offheap_max_memory,
        partitions: 8,
        ..Default::default()
    }
}

fn start(
    config: &StoreConfig,
    ctx: StoreContext<String, String>,
    region: Arc<MemoryRegion>,
    swap: Arc<FileSwapSpace>,
) -> TieredStore<String, String> {
    TieredStore::start(config, true, ctx, region, swap).unwrap()
}

fn swap_only(tmp: &TempDir) -> TieredStore<String, String> {
    start(
        &config(-1),
        StoreContext::standalone(8),
        Arc::new(MemoryRegion::default()),
        Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap()),
    )
}

fn both(tmp: &TempDir) -> TieredStore<String, String> {
    start(
        &config(0),
        StoreContext::standalone(8),
        Arc::new(MemoryRegion::default()),
        Arc::new(FileSwapSpace::new(tmp.path(), Some(3)).unwrap()),
    )
}

fn s(v: &str) -> String {
    v.to_string()
}

fn value_of(store: &TieredStore<String, String>, key: &str) -> Option<String> {
    store
        .read_key(&s(key))
        .unwrap()
        .and_then(|e| e.value.into_object())
}

#[test]
fn test_absent_keys_are_not_errors() {
    let (cold_dir, warm_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    for store in [swap_only(&cold_dir), both(&warm_dir)] {
        let key = s("missing");
        let key_bytes = store.codec().marshal_key(&key).unwrap();

        assert!(!store.contains_key(&key, &key_bytes).unwrap());
        assert!(store.read(&key, &key_bytes).unwrap().is_none());
        assert!(store.read_and_remove(&key, &key_bytes).unwrap().is_none());
        store.remove(&key, &key_bytes).unwrap();
    }
}

#[test]
fn test_swap_only_scenario() {
    let tmp = TempDir::new().unwrap();
    let store = swap_only(&tmp);
    assert_eq!(store.selection(), TierSelection::SwapOnly);

    let key = s("k1");
    let key_bytes = store.codec().marshal_key(&key).unwrap();
    let envelope = store
        .codec()
        .envelope_for(&key_bytes, &s("V1"), CacheVersion::new(1, 1, 0))
        .unwrap()
        .with_ttl(0, 0);
    store.write(&key, key_bytes.clone(), &envelope).unwrap();

    assert!(store.contains_key(&key, &key_bytes).unwrap());
    assert_eq!(value_of(&store, "k1"), Some(s("V1")));

    let removed = store.read_and_remove(&key, &key_bytes).unwrap().unwrap();
    assert_eq!(removed.value, SwapValue::Object(s("V1")));
    assert_eq!(removed.version(), CacheVersion::new(1, 1, 0));

    assert!(store.read_and_remove(&key, &key_bytes).unwrap().is_none());
    assert_eq!(store.swap_keys().unwrap(), 0);
}

#[test]
fn test_round_trip_on_either_tier() {
    let (cold_dir, warm_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    for store in [swap_only(&cold_dir), both(&warm_dir)] {
        store
            .write_value(&s("k"), &s("value"), CacheVersion::default())
            .unwrap();
        assert_eq!(value_of(&store, "k"), Some(s("value")));
    }
}

#[test]
fn test_raw_byte_values() {
    let tmp = TempDir::new().unwrap();
    let store = both(&tmp);

    let key = s("blob");
    let key_bytes = store.codec().marshal_key(&key).unwrap();
    let envelope = EntryEnvelope::raw(0, vec![0u8, 1, 2, 255], CacheVersion::default());
    store.write(&key, key_bytes, &envelope).unwrap();

    let entry = store.read_key(&key).unwrap().unwrap();
    assert_eq!(entry.value, SwapValue::Bytes(vec![0u8, 1, 2, 255].into()));
}

#[test]
fn test_single_tier_invariant() {
    let tmp = TempDir::new().unwrap();
    let store = both(&tmp);
    assert_eq!(store.selection(), TierSelection::Both);

    store
        .write_value(&s("k"), &s("v"), CacheVersion::default())
        .unwrap();

    assert_eq!(store.off_heap_entries_count(), 1);
    assert!(store.off_heap_allocated_size() > 0);
    assert_eq!(store.swap_keys().unwrap(), 0);
    assert_eq!(store.swap_size().unwrap(), 0);
}

#[test]
fn test_read_and_remove_is_terminal_off_heap() {
    let tmp = TempDir::new().unwrap();
    let store = both(&tmp);
    store
        .write_value(&s("k"), &s("v"), CacheVersion::default())
        .unwrap();

    assert!(store.read_and_remove_key(&s("k")).unwrap().is_some());
    assert!(store.read_and_remove_key(&s("k")).unwrap().is_none());
    assert_eq!(store.off_heap_entries_count(), 0);
}

#[test]
fn test_remove_without_returning() {
    let (cold_dir, warm_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    for store in [swap_only(&cold_dir), both(&warm_dir)] {
        store
            .write_value(&s("k"), &s("v"), CacheVersion::default())
            .unwrap();
        let key_bytes = store.codec().marshal_key(&s("k")).unwrap();
        store.remove(&s("k"), &key_bytes).unwrap();
        assert!(value_of(&store, "k").is_none());
    }
}

#[test]
fn test_read_and_remove_all_across_tiers() {
    let tmp = TempDir::new().unwrap();
    let region = Arc::new(MemoryRegion::default());
    let swap = Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap());

    // Same swap space, seen through a swap-only store and a two-tier store.
    let cold = start(&config(-1), StoreContext::standalone(8), region.clone(), swap.clone());
    let store = start(&config(0), StoreContext::standalone(8), region, swap);

    for k in ["a", "b", "c"] {
        store.write_value(&s(k), &s(k), CacheVersion::default()).unwrap();
    }
    for k in ["d", "e", "f"] {
        cold.write_value(&s(k), &s(k), CacheVersion::default()).unwrap();
    }
    assert_eq!(store.off_heap_entries_count(), 3);
    assert_eq!(store.swap_keys().unwrap(), 3);

    let keys: Vec<String> = ["a", "b", "c", "d", "e", "f", "missing"].iter().map(|k| s(k)).collect();
    let removed = store.read_and_remove_all(&keys).unwrap();

    let mut got: Vec<String> = removed
        .into_iter()
        .map(|e: BatchSwapEntry<String, String>| {
            assert_eq!(e.value.as_ref().and_then(|v| v.as_object()), Some(&e.key));
            e.key
        })
        .collect();
    got.sort();
    assert_eq!(got, vec!["a", "b", "c", "d", "e", "f"]);

    assert_eq!(store.off_heap_entries_count(), 0);
    assert_eq!(store.swap_keys().unwrap(), 0);
}

#[test]
fn test_write_all_to_each_tier() {
    let (cold_dir, warm_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let affinity = HashAffinity::new(8);
    for store in [swap_only(&cold_dir), both(&warm_dir)] {
        let batch: Vec<BatchSwapEntry<String, String>> = (0..10)
            .map(|i| {
                let key = format!("key-{i}");
                let key_bytes = store.codec().marshal_key(&key).unwrap();
                let envelope = store
                    .codec()
                    .envelope_for(&key_bytes, &format!("value-{i}"), CacheVersion::default())
                    .unwrap();
                let part = affinity.partition(&key);
                BatchSwapEntry::new(key, key_bytes, part, envelope)
            })
            .collect();

        store.write_all(&batch).unwrap();
        assert_eq!(value_of(&store, "key-3"), Some(s("value-3")));

        let stored = store.off_heap_entries_count() as i64 + store.swap_keys().unwrap();
        assert_eq!(stored, 10);
    }
}

#[test]
fn test_clear_tiers() {
    let tmp = TempDir::new().unwrap();
    let region = Arc::new(MemoryRegion::default());
    let swap = Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap());
    let cold = start(&config(-1), StoreContext::standalone(8), region.clone(), swap.clone());
    let store = start(&config(0), StoreContext::standalone(8), region, swap);

    store.write_value(&s("hot"), &s("v"), CacheVersion::default()).unwrap();
    cold.write_value(&s("cold"), &s("v"), CacheVersion::default()).unwrap();

    store.clear_off_heap().unwrap();
    assert_eq!(store.off_heap_entries_count(), 0);
    assert_eq!(store.swap_keys().unwrap(), 1);

    store.clear_swap().unwrap();
    assert_eq!(store.swap_keys().unwrap(), 0);
    assert!(value_of(&store, "cold").is_none());
}

#[derive(Default)]
struct RecordingQueries {
    swapped: AtomicUsize,
    unswapped: AtomicUsize,
}

impl QueryIndex<String, String> for RecordingQueries {
    fn on_swap(&self, space: &str, _key: &String) {
        assert_eq!(space, "default");
        self.swapped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_unswap(&self, key: &String, value: &SwapValue<String>, _value_bytes: &[u8]) {
        assert_eq!(value.as_object(), Some(key));
        self.unswapped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_query_index_hooks() {
    let tmp = TempDir::new().unwrap();
    let queries = Arc::new(RecordingQueries::default());
    let store = start(
        &config(-1),
        StoreContext::standalone(8).with_queries(queries.clone()),
        Arc::new(MemoryRegion::new(EvictionConfig::default())),
        Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap()),
    );

    for k in ["a", "b"] {
        store.write_value(&s(k), &s(k), CacheVersion::default()).unwrap();
    }
    assert_eq!(queries.swapped.load(Ordering::SeqCst), 2);

    store.read_and_remove_key(&s("a")).unwrap();
    let key_bytes = store.codec().marshal_key(&s("b")).unwrap();
    store.remove(&s("b"), &key_bytes).unwrap();
    assert_eq!(queries.unswapped.load(Ordering::SeqCst), 2);
}

#[test]
fn test_disabled_store_counters() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(0);
    cfg.enabled = false;
    let store = start(
        &cfg,
        StoreContext::standalone(8),
        Arc::new(MemoryRegion::default()),
        Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap()),
    );

    assert_eq!(store.selection(), TierSelection::Neither);
    assert_eq!(store.swap_size().unwrap(), -1);
    assert_eq!(store.swap_keys().unwrap(), -1);
    assert_eq!(store.off_heap_entries_count(), 0);
    assert!(store.read_and_remove_all(&[s("k")]).unwrap().is_empty());
}
