//! Performance benchmarks for query-cache
//!
//! This benchmark suite measures:
//! - Key generation (model calls with joins, free-form queries)
//! - InMemory backend operations (set, get)
//! - QueryCache resolution (hit, miss, bypass) across result sizes
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use query_cache::backend::{CacheBackend, InMemoryBackend};
use query_cache::key::CacheKeyBuilder;
use query_cache::model::ModelDef;
use query_cache::repository::InMemoryDatabase;
use query_cache::statement::SqlCompiler;
use query_cache::{
    use_cache, Condition, FindOptions, Include, QueryDescriptor, RawQueryOptions,
};
use serde_json::json;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Benchmark Fixtures
// ============================================================================

fn database(rows: usize) -> InMemoryDatabase {
    let mut db = InMemoryDatabase::new();
    db.define(
        ModelDef::new("projects")
            .attribute("title")
            .attribute("description")
            .has_many("users", "users", "projectId"),
    )
    .define(
        ModelDef::new("users")
            .attribute("name")
            .belongs_to("project", "projects", "projectId"),
    );

    for i in 0..rows {
        db.insert(
            "projects",
            json!({"title": format!("project {}", i), "description": "x".repeat(64)}),
        )
        .expect("Failed to insert project");
        db.insert("users", json!({"name": format!("user {}", i), "projectId": i + 1}))
            .expect("Failed to insert user");
    }
    db
}

// ============================================================================
// Group 1: Key Generation
// ============================================================================

fn key_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");
    let db = database(0);
    let registry = query_cache::DataSource::models(&db);
    let keys = CacheKeyBuilder::default();

    let plain = FindOptions::default()
        .filter("name", Condition::Eq(json!("baz")))
        .cached();
    group.bench_function("find_all", |b| {
        b.iter(|| {
            keys.generate(
                black_box(&QueryDescriptor::FindAll {
                    model: "users",
                    options: &plain,
                }),
                &registry,
                &SqlCompiler,
            )
        })
    });

    let joined = plain.clone().include(Include::new("project"));
    group.bench_function("find_all_include", |b| {
        b.iter(|| {
            keys.generate(
                black_box(&QueryDescriptor::FindAll {
                    model: "users",
                    options: &joined,
                }),
                &registry,
                &SqlCompiler,
            )
        })
    });

    let raw = RawQueryOptions::select()
        .replacement("title", "foo")
        .cached();
    group.bench_function("raw_query", |b| {
        b.iter(|| {
            keys.generate(
                black_box(&QueryDescriptor::Query {
                    sql: "SELECT * FROM projects WHERE title = :title",
                    options: &raw,
                }),
                &registry,
                &SqlCompiler,
            )
        })
    });

    group.finish();
}

// ============================================================================
// Group 2: InMemory Backend Benchmarks
// ============================================================================

fn inmemory_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_backend");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    for size in [100, 1_000, 10_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("set", size), size, |b, &size| {
                let backend = InMemoryBackend::new();
                let value = vec![1u8; size];

                b.to_async(&rt).iter(|| async {
                    backend
                        .set(black_box("test_key"), black_box(value.clone()), None)
                        .await
                        .expect("Failed to set")
                });
            });

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                let backend = InMemoryBackend::new();
                rt.block_on(async {
                    backend
                        .set("test_key", vec![1u8; size], None)
                        .await
                        .expect("Failed to set");
                });

                b.to_async(&rt)
                    .iter(|| async { backend.get(black_box("test_key")).await });
            });
    }

    group.finish();
}

// ============================================================================
// Group 3: QueryCache Resolution
// ============================================================================

fn query_cache_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_cache");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    for rows in [1, 10, 100].iter() {
        // Measures: key generation + cache lookup + decode + rehydration
        group.bench_with_input(BenchmarkId::new("find_all_hit", rows), rows, |b, &rows| {
            let cache = use_cache(database(rows), InMemoryBackend::new());
            let options = FindOptions::default().cached();
            let descriptor = QueryDescriptor::FindAll {
                model: "projects",
                options: &options,
            };
            rt.block_on(async {
                cache
                    .resolve(&descriptor)
                    .await
                    .expect("Failed to populate cache");
                cache.flush().await;
            });

            b.to_async(&rt)
                .iter(|| async { cache.resolve(black_box(&descriptor)).await });
        });

        // Measures: key generation + lookup + query + encode + store
        group.bench_with_input(BenchmarkId::new("find_all_miss", rows), rows, |b, &rows| {
            let cache = Arc::new(use_cache(database(rows), InMemoryBackend::new()));
            let counter = Arc::new(AtomicU64::new(0));

            b.to_async(&rt).iter(|| {
                let cache = Arc::clone(&cache);
                let counter = Arc::clone(&counter);
                async move {
                    // A fresh offset per iteration forces a new key.
                    let offset = counter.fetch_add(1, Ordering::Relaxed);
                    let options = FindOptions::default().cached().offset(offset);
                    cache
                        .resolve(&QueryDescriptor::FindAll {
                            model: "projects",
                            options: &options,
                        })
                        .await
                }
            });
        });
    }

    // Measures: interception overhead on calls that did not opt in
    group.bench_function("bypass", |b| {
        let cache = use_cache(database(10), InMemoryBackend::new());
        let options = FindOptions::default();
        let descriptor = QueryDescriptor::FindAll {
            model: "projects",
            options: &options,
        };

        b.to_async(&rt)
            .iter(|| async { cache.resolve(black_box(&descriptor)).await });
    });

    group.finish();
}

criterion_group!(
    benches,
    key_benchmarks,
    inmemory_benchmarks,
    query_cache_benchmarks
);
criterion_main!(benches);
