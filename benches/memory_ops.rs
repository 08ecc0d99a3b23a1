//! Performance benchmarks for memory operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memvault::crypto::{EnvelopeService, KeyPair};
use memvault::embedding::EmbeddingService;
use memvault::types::*;
use memvault::{SqliteBackend, StorageProvider};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn backend(rt: &Runtime, encrypted: bool) -> SqliteBackend {
    let envelope = encrypted.then(|| Arc::new(EnvelopeService::new(KeyPair::generate())));
    let backend = SqliteBackend::in_memory(envelope, Arc::new(EmbeddingService::disabled())).unwrap();
    rt.block_on(backend.initialize()).unwrap();
    backend
}

fn new_memory(i: usize) -> NewMemory {
    NewMemory::try_from(AddMemoryInput {
        content: format!(
            "Memory content number {} with some longer text to simulate real usage",
            i
        ),
        tags: vec![format!("tag{}", i % 10), format!("category{}", i % 5)],
        importance: Some((i % 10) as i64 + 1),
        ..Default::default()
    })
    .unwrap()
}

fn seed(rt: &Runtime, backend: &SqliteBackend, n: usize) {
    rt.block_on(async {
        for i in 0..n {
            backend.add_memory(new_memory(i)).await.unwrap();
        }
    });
}

fn bench_memory_add(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("memory_add");
    group.throughput(Throughput::Elements(1));

    for encrypted in [false, true] {
        let backend = backend(&rt, encrypted);
        let label = if encrypted { "sealed" } else { "plain" };
        group.bench_function(label, |b| {
            let mut i = 0;
            b.iter(|| {
                i += 1;
                rt.block_on(backend.add_memory(black_box(new_memory(i))))
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_memory_search(c: &mut Criterion) {
    let rt = runtime();
    let plain = backend(&rt, false);
    let sealed = backend(&rt, true);
    seed(&rt, &plain, 1000);
    seed(&rt, &sealed, 1000);

    let mut group = c.benchmark_group("memory_search");

    for limit in [10, 50, 100].iter() {
        group.throughput(Throughput::Elements(*limit as u64));

        group.bench_with_input(BenchmarkId::new("substring", limit), limit, |b, &limit| {
            b.iter(|| {
                let query = MemoryQuery {
                    query: Some("number 9".to_string()),
                    limit: Some(limit),
                    ..Default::default()
                };
                rt.block_on(plain.search_memories(black_box(query))).unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("with_tag_filter", limit), limit, |b, &limit| {
            b.iter(|| {
                let query = MemoryQuery {
                    tags: vec!["tag5".to_string()],
                    limit: Some(limit),
                    sort_by: MemorySortField::Importance,
                    ..Default::default()
                };
                rt.block_on(plain.search_memories(black_box(query))).unwrap()
            })
        });

        group.bench_with_input(
            BenchmarkId::new("sealed_substring", limit),
            limit,
            |b, &limit| {
                b.iter(|| {
                    let query = MemoryQuery {
                        query: Some("number 9".to_string()),
                        limit: Some(limit),
                        ..Default::default()
                    };
                    rt.block_on(sealed.search_memories(black_box(query))).unwrap()
                })
            },
        );
    }

    group.finish();
}

fn bench_memory_recent(c: &mut Criterion) {
    let rt = runtime();
    let backend = backend(&rt, false);
    seed(&rt, &backend, 1000);

    c.bench_function("memory_recent_50", |b| {
        b.iter(|| rt.block_on(backend.get_recent_memories(black_box(50))).unwrap())
    });
}

criterion_group!(
    benches,
    bench_memory_add,
    bench_memory_search,
    bench_memory_recent,
);
criterion_main!(benches);
