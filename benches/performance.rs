//! Performance benchmarks for sharded-counter
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Contended increment throughput as the shard count grows
//! - Aggregate reads served from the cache versus rebuilt from shards
//! - The compare-and-swap cache adjustment on its own

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use sharded_counter::cache::{CounterCache, DisabledCache, MokaCounterCache};
use sharded_counter::config::{CacheConfig, Config, ServiceConfig};
use sharded_counter::metrics::CacheMetrics;
use sharded_counter::queue::{channel, ChannelTaskQueue};
use sharded_counter::{CountAggregator, MemoryStore, Metrics, ShardedCounterService};

type BenchService<C> = ShardedCounterService<MemoryStore, C, ChannelTaskQueue>;

fn create_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn build_service<C: CounterCache + 'static>(num_shards: u32, cache: C) -> Arc<BenchService<C>> {
    let config = Config {
        service: ServiceConfig::with_initial_shards(num_shards),
        ..Config::default()
    };
    // Deletion jobs are never issued here, so the receiver can go.
    let (queue, _receiver) = channel(1);
    let service = ShardedCounterService::new(
        &config,
        Arc::new(MemoryStore::new(1_000)),
        Arc::new(cache),
        Arc::new(queue),
        Arc::new(Metrics::new()),
    )
    .unwrap();
    Arc::new(service)
}

/// Benchmark contended increments with varying shard counts
fn bench_increment_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("increment_contention");
    let tasks = 16u64;
    let per_task = 50u64;
    group.throughput(Throughput::Elements(tasks * per_task));

    for num_shards in [1u32, 4, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::new("shards", num_shards),
            num_shards,
            |b, &num_shards| {
                let rt = create_runtime();
                b.iter(|| {
                    rt.block_on(async {
                        let service = build_service(num_shards, MokaCounterCache::default());
                        service.create("bench").await.unwrap();

                        let handles: Vec<_> = (0..tasks)
                            .map(|_| {
                                let service = Arc::clone(&service);
                                tokio::spawn(async move {
                                    for _ in 0..per_task {
                                        service.increment("bench", 1).await.unwrap();
                                    }
                                })
                            })
                            .collect();
                        for handle in handles {
                            handle.await.unwrap();
                        }
                        black_box(service.reconstruct_count("bench").await.unwrap());
                    });
                });
            },
        );
    }

    group.finish();
}

/// Benchmark aggregate reads: warm cache versus reconstruction
fn bench_aggregate_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_reads");
    let rt = create_runtime();

    for num_shards in [1u32, 10, 100].iter() {
        let cached = build_service(*num_shards, MokaCounterCache::default());
        let uncached = build_service(*num_shards, DisabledCache);
        rt.block_on(async {
            cached.create("read").await.unwrap();
            cached.increment("read", 500).await.unwrap();
            uncached.create("read").await.unwrap();
            uncached.increment("read", 500).await.unwrap();
        });

        group.bench_with_input(BenchmarkId::new("cache_hit", num_shards), num_shards, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(cached.get_counter("read").await.unwrap());
            });
        });

        group.bench_with_input(
            BenchmarkId::new("reconstruct", num_shards),
            num_shards,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    black_box(uncached.get_counter("read").await.unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the compare-and-swap adjustment loop in isolation
fn bench_cache_adjust(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_adjust");
    let rt = create_runtime();

    let aggregator = CountAggregator::new(
        Arc::new(MemoryStore::default()),
        Arc::new(MokaCounterCache::default()),
        &CacheConfig::default(),
        Arc::new(CacheMetrics::new()),
    );
    rt.block_on(aggregator.prime("adjust"));

    group.bench_function("sequential", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(aggregator.adjust("adjust", 1).await);
        });
    });

    let cache = MokaCounterCache::default();
    rt.block_on(cache.set("incr", 0, Duration::from_secs(600))).unwrap();
    group.bench_function("increment_by", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.increment_by("incr", 1).await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_increment_contention,
    bench_aggregate_reads,
    bench_cache_adjust
);
criterion_main!(benches);
