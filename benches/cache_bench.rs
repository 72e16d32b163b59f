//! Benchmarks for the cache hot path.
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;
use std::hint::black_box;
use std::time::{Duration, SystemTime};

use detour_cache::dns::{CLASS_IN, CachedRecord, TYPE_A};
use detour_cache::sweeper::Sweeper;
use detour_cache::{CacheEntry, CacheKey, DnsCache};

fn entry(ttl: u32, inserted_at: SystemTime) -> CacheEntry {
    let record = CachedRecord {
        name: "example.com".to_string(),
        rtype: TYPE_A,
        class: CLASS_IN,
        rdata: vec![93, 184, 216, 34],
    };
    CacheEntry::new(vec![record], ttl, inserted_at).expect("non-empty record set")
}

fn populated_cache(size: usize) -> DnsCache {
    let cache = DnsCache::new();
    let now = SystemTime::now();
    for i in 0..size {
        cache.put(CacheKey::new(&format!("host{}.example.com", i), TYPE_A), entry(300, now));
    }
    cache
}

fn bench_get(c: &mut Criterion) {
    let cache = populated_cache(10_000);
    let hit = CacheKey::new("host4242.example.com", TYPE_A);
    let miss = CacheKey::new("absent.example.com", TYPE_A);

    c.bench_function("cache_get_hit", |b| b.iter(|| cache.get(black_box(&hit))));
    c.bench_function("cache_get_miss", |b| b.iter(|| cache.get(black_box(&miss))));
}

fn bench_put(c: &mut Criterion) {
    let cache = populated_cache(10_000);
    let now = SystemTime::now();
    let mut rng = rand::rng();

    c.bench_function("cache_put_random", |b| {
        b.iter(|| {
            let i: u32 = rng.random_range(0..20_000);
            cache.put(
                CacheKey::new(&format!("host{}.example.com", i), TYPE_A),
                entry(300, now),
            );
        })
    });
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");

    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("half_expired", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let cache = std::sync::Arc::new(populated_cache(size / 2));
                    let past = SystemTime::now() - Duration::from_secs(600);
                    for i in 0..size / 2 {
                        cache.put(CacheKey::new(&format!("old{}.example.com", i), TYPE_A), entry(60, past));
                    }
                    Sweeper::new(cache, Default::default(), Duration::from_secs(1))
                },
                |sweeper| sweeper.sweep(),
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get, bench_put, bench_sweep);
criterion_main!(benches);
