//! Benchmarks for the tiered store.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use tiered_swap::config::{EvictionConfig, StoreConfig};
use tiered_swap::context::StoreContext;
use tiered_swap::engine::evictor::Evictor;
use tiered_swap::engine::region::MemoryRegion;
use tiered_swap::engine::swap_file::FileSwapSpace;
use tiered_swap::store::entry::CacheVersion;
use tiered_swap::TieredStore;

fn store(offheap_max_memory: i64, tmp: &TempDir) -> TieredStore<String, String> {
    let config = StoreConfig {
        offheap_max_memory,
        ..Default::default()
    };
    TieredStore::start(
        &config,
        true,
        StoreContext::standalone(config.partitions),
        Arc::new(MemoryRegion::default()),
        Arc::new(FileSwapSpace::new(tmp.path(), Some(3)).unwrap()),
    )
    .unwrap()
}

fn bench_eviction_scoring(c: &mut Criterion) {
    let evictor = Evictor::new(EvictionConfig::default());

    // 10,000 region slots of 1 KiB each.
    let candidates: Vec<(u32, Bytes, u64, u64)> = (0..10_000u64)
        .map(|i| ((i % 64) as u32, Bytes::from(i.to_le_bytes().to_vec()), i, 1024))
        .collect();

    c.bench_function("eviction_select_100kib_from_10k", |b| {
        b.iter(|| {
            let victims = evictor.select_victims(
                black_box(candidates.iter().cloned()),
                100 * 1024,
                10_000,
                &[],
            );
            black_box(victims);
        })
    });
}

fn bench_off_heap_write_read(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = store(0, &tmp);
    let value = "v".repeat(1024);

    for i in 0..1_000 {
        store
            .write_value(&format!("key-{i}"), &value, CacheVersion::default())
            .unwrap();
    }

    c.bench_function("offheap_write_1kb", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store
                .write_value(&format!("key-{}", i % 1_000), black_box(&value), CacheVersion::default())
                .unwrap();
        })
    });

    c.bench_function("offheap_read_1kb", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(store.read_key(&format!("key-{}", i % 1_000)).unwrap());
        })
    });
}

fn bench_swap_write_read(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let store = store(-1, &tmp);
    let value = "v".repeat(16 * 1024);

    c.bench_function("swap_write_16kb_zstd", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store
                .write_value(&format!("key-{}", i % 256), black_box(&value), CacheVersion::default())
                .unwrap();
        })
    });

    c.bench_function("swap_read_16kb_zstd", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(store.read_key(&format!("key-{}", i % 256)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_eviction_scoring,
    bench_off_heap_write_read,
    bench_swap_write_read,
);
criterion_main!(benches);
