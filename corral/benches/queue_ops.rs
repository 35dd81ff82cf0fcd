//! Benchmarks for task queue operations using criterion.
//!
//! Measured against the in-memory store:
//! - Single job enqueue
//! - Enqueue batches of increasing size
//! - Concurrent dequeue by several consumers
//! - Full lifecycle (enqueue, dequeue, complete)

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use corral::{EnqueueOptions, MemoryStore, QueueConfig, TaskQueue, TaskRegistry};
use corral_testkit::RecordingHandler;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use serde_json::json;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn new_queue() -> Arc<TaskQueue<MemoryStore>> {
    let registry = TaskRegistry::new().with_handler("echo", RecordingHandler::echo());
    Arc::new(TaskQueue::new(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
        QueueConfig::default(),
    ))
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let queue = new_queue();
        let payload = json!({ "name": "bench-job" });

        b.to_async(&rt).iter(|| async {
            queue
                .enqueue("echo", payload.clone(), EnqueueOptions::default())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

fn bench_enqueue_batch(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_batch");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(15));

    for batch_size in [10usize, 50, 100, 200] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            &batch_size,
            |b, &size| {
                let queue = new_queue();

                b.to_async(&rt).iter(|| async {
                    for i in 0..size {
                        queue
                            .enqueue("echo", json!(i), EnqueueOptions::default())
                            .await
                            .expect("enqueue should succeed");
                    }
                });
            },
        );
    }

    group.finish();
}

/// Several consumers racing to drain the same pending list.
fn bench_dequeue_contention(c: &mut Criterion) {
    let rt = create_runtime();
    const JOBS: usize = 200;

    let mut group = c.benchmark_group("dequeue_contention");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(15));
    group.throughput(Throughput::Elements(JOBS as u64));

    for consumers in [1usize, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, &consumers| {
                b.to_async(&rt).iter(|| async move {
                    let queue = new_queue();
                    for i in 0..JOBS {
                        queue
                            .enqueue("echo", json!(i), EnqueueOptions::default())
                            .await
                            .expect("enqueue should succeed");
                    }

                    let drained = join_all((0..consumers).map(|c| {
                        let queue = Arc::clone(&queue);
                        async move {
                            let worker_id = format!("bench-{c}");
                            let mut count = 0;
                            while let Some(lease) =
                                queue.try_dequeue(&worker_id).await.expect("dequeue")
                            {
                                queue
                                    .complete_lease(&lease, json!(null))
                                    .await
                                    .expect("complete");
                                count += 1;
                            }
                            count
                        }
                    }))
                    .await;
                    assert_eq!(drained.iter().sum::<usize>(), JOBS);
                });
            },
        );
    }

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("enqueue_dequeue_complete", |b| {
        let queue = new_queue();

        b.to_async(&rt).iter(|| async {
            let id = queue
                .enqueue("echo", json!({ "x": 1 }), EnqueueOptions::default())
                .await
                .expect("enqueue should succeed");
            let lease = queue
                .try_dequeue("bench")
                .await
                .expect("dequeue should succeed")
                .expect("job available");
            debug_assert_eq!(lease.job_id(), id);
            queue
                .complete_lease(&lease, json!("done"))
                .await
                .expect("complete should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_enqueue_batch,
    bench_dequeue_contention,
    bench_full_lifecycle
);
criterion_main!(benches);
