use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use poolserver::queue::{ConnectionQueue, Entry, QueueBound};
use poolserver::worker_pool::{WorkerPool, WorkerPoolConfig};
use poolserver::ServerMetrics;
use std::sync::Arc;
use std::thread;

const ITEMS: usize = 10_000;

/// Push/pop on one thread (no contention baseline)
fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_single_thread");
    group.throughput(Throughput::Elements(ITEMS as u64));

    group.bench_function("push_then_pop", |b| {
        let queue = ConnectionQueue::unbounded();
        b.iter(|| {
            for i in 0..ITEMS {
                queue.push(black_box(i));
            }
            for _ in 0..ITEMS {
                black_box(queue.pop());
            }
        });
    });

    group.finish();
}

/// One producer feeding N consumers, ended by one sentinel per consumer
fn bench_mpmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_mpmc");
    group.sample_size(20); // Thread spawn per iteration
    group.throughput(Throughput::Elements(ITEMS as u64));

    for bound in [QueueBound::Unbounded, QueueBound::Bounded(64)] {
        for consumers in [1usize, 4, 8] {
            let label = match bound {
                QueueBound::Unbounded => format!("unbounded/{consumers}"),
                QueueBound::Bounded(n) => format!("bounded_{n}/{consumers}"),
            };
            let id = BenchmarkId::new("consumers", label);
            group.bench_with_input(id, &consumers, |b, &consumers| {
                b.iter(|| {
                    let queue = Arc::new(ConnectionQueue::new(bound));
                    let handles: Vec<_> = (0..consumers)
                        .map(|_| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                let mut seen = 0usize;
                                while let Entry::Item(i) = queue.pop() {
                                    seen += black_box(i) & 1;
                                }
                                seen
                            })
                        })
                        .collect();

                    for i in 0..ITEMS {
                        queue.push(i);
                    }
                    for _ in 0..consumers {
                        queue.push_sentinel();
                    }
                    for h in handles {
                        black_box(h.join().unwrap_or(0));
                    }
                });
            });
        }
    }

    group.finish();
}

/// Full pool path: dispatch, worker wake-up, catch_unwind, metrics
fn bench_pool_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_dispatch");
    group.sample_size(20);
    group.throughput(Throughput::Elements(ITEMS as u64));

    for workers in [1usize, 4] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.iter(|| {
                let config = WorkerPoolConfig {
                    num_workers: workers,
                    ..WorkerPoolConfig::default()
                };
                let mut pool = WorkerPool::new(config, Arc::new(ServerMetrics::new()));
                if pool
                    .start(|_worker: usize, item: usize| -> anyhow::Result<()> {
                        black_box(item);
                        Ok(())
                    })
                    .is_err()
                {
                    return;
                }
                for i in 0..ITEMS {
                    black_box(pool.dispatch(i));
                }
                pool.shutdown();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_mpmc, bench_pool_dispatch);
criterion_main!(benches);
