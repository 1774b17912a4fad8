//! Benchmarks for the cache store
//!
//! This benchmark measures:
//! - Cache key derivation (canonical JSON + SHA-256)
//! - Memory backend get/put through the typed store
//! - File backend get/put (envelope encode, atomic rename)

use coursegen_resilience::cache::{
    CacheConfig, CacheKey, CacheKeyGenerator, CacheStore, FileCache, MemoryCache,
};
use coursegen_resilience::telemetry::MetricsRegistry;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

const PROMPT: &str = "Write a 10-question quiz on retrieval-augmented generation. \
Each question has four options and exactly one correct answer. Return JSON.";

fn bench_key_derivation(c: &mut Criterion) {
    let keys = CacheKeyGenerator::new().with_salt("bench");
    let mut group = c.benchmark_group("cache_keys");
    group.throughput(Throughput::Bytes(PROMPT.len() as u64));

    group.bench_function("completion", |b| {
        b.iter(|| {
            black_box(keys.completion(
                "gpt-4o",
                Some("You are a course author."),
                black_box(PROMPT),
                Some(0.7),
            ))
        })
    });

    group.bench_function("image", |b| {
        b.iter(|| black_box(keys.image("flux-pro", black_box(PROMPT), 1024, 768)))
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let stores = [
        (
            "memory",
            CacheStore::new(
                CacheConfig::default(),
                Arc::new(MemoryCache::new(10_000)),
                Arc::new(MetricsRegistry::new()),
            ),
        ),
        (
            "file",
            CacheStore::new(
                CacheConfig::default(),
                Arc::new(FileCache::open(dir.path()).unwrap()),
                Arc::new(MetricsRegistry::new()),
            ),
        ),
    ];
    let value = PROMPT.repeat(8);
    let key = CacheKey::new("bench-key");
    let (value, key) = (&value, &key);

    let mut group = c.benchmark_group("cache_store");
    for (name, store) in &stores {
        rt.block_on(store.put(key, value)).unwrap();

        group.bench_with_input(BenchmarkId::new("get_hit", name), store, |b, store| {
            b.to_async(&rt)
                .iter(|| async move { black_box(store.get::<String>(key).await) })
        });

        group.bench_with_input(BenchmarkId::new("put", name), store, |b, store| {
            b.to_async(&rt)
                .iter(|| async move { store.put(key, black_box(value)).await.unwrap() })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_key_derivation, bench_store);
criterion_main!(benches);
