//! Benchmarks for queue manager coordination over the in-memory cache.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use drover_core::cache::{CacheBackend, InMemoryBackend, NoopBackend};
use drover_core::config::QueueConfig;
use drover_core::jobs::{JobId, Priority, QueueJobStatus, QueueManager};

fn manager(cache: Arc<dyn CacheBackend>) -> QueueManager {
    QueueManager::new(cache, QueueConfig { instance_id: Some("bench".to_string()), lock_retries: 0, ..QueueConfig::default() })
}

fn bench_lock_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_cycle");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for (name, cache) in [("in_memory", Arc::new(InMemoryBackend::new()) as Arc<dyn CacheBackend>), ("noop", Arc::new(NoopBackend) as Arc<dyn CacheBackend>)] {
        let queue = manager(cache);
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                let job = JobId::new();
                black_box(queue.acquire_lock(job, Duration::from_secs(30)).await.unwrap());
                black_box(queue.release_lock(job).await.unwrap());
            });
        });
    }
    group.finish();
}

fn bench_contended_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_acquire");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
    let owner = manager(cache.clone());
    let other = QueueManager::new(cache, QueueConfig { instance_id: Some("other".to_string()), lock_retries: 0, ..QueueConfig::default() });
    let job = JobId::new();
    rt.block_on(async { owner.acquire_lock(job, Duration::from_secs(3600)).await.unwrap(); });
    group.bench_function("held_elsewhere", |b| { b.to_async(&rt).iter(|| async { black_box(other.acquire_lock(job, Duration::from_secs(30)).await.unwrap()); }); });
    group.finish();
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_dequeue");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for batch in [1usize, 16, 128] {
        let queue = manager(Arc::new(InMemoryBackend::new()));
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.to_async(&rt).iter(|| async {
                for _ in 0..batch { queue.enqueue_job(JobId::new(), Priority::NORMAL).await.unwrap(); }
                while let Some(id) = queue.dequeue_job().await.unwrap() { black_box(id); }
            });
        });
    }
    group.finish();
}

fn bench_status_mirror(c: &mut Criterion) {
    let mut group = c.benchmark_group("status_mirror");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let queue = manager(Arc::new(InMemoryBackend::new()));
    let job = JobId::new();
    group.bench_function("set_get", |b| {
        b.to_async(&rt).iter(|| async {
            queue.set_job_status(job, QueueJobStatus::Processing).await.unwrap();
            black_box(queue.get_job_status(job).await.unwrap());
        });
    });
    group.finish();
}

criterion_group!(benches, bench_lock_cycle, bench_contended_acquire, bench_enqueue_dequeue, bench_status_mirror);
criterion_main!(benches);
