//! Task queue posting and draining throughput
//!
//! Run with: cargo bench -p trackline-runtime

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use trackline_runtime::platform::EventFd;
use trackline_runtime::task::{Task, TaskQueue};

fn tasks(n: usize) -> Vec<Task> {
    (0..n).map(|_| Task::new("bench", |_| {})).collect()
}

fn bench_post_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_drain");

    for n in [16usize, 256, 4096] {
        let post = Arc::new(EventFd::new().unwrap());
        let queue = TaskQueue::new(n, Arc::clone(&post));
        let batch = tasks(n);

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                for t in &batch {
                    black_box(queue.post(t).unwrap());
                }
                let drained = queue.drain(|t| {
                    black_box(t);
                });
                post.drain();
                black_box(drained)
            })
        });
    }
    group.finish();
}

fn bench_repost_coalesced(c: &mut Criterion) {
    let post = Arc::new(EventFd::new().unwrap());
    let queue = TaskQueue::new(64, Arc::clone(&post));
    let task = Task::new("bench", |_| {});

    c.bench_function("repost_coalesced", |b| {
        b.iter(|| {
            // Only the first post queues; the rest are no-ops
            for _ in 0..8 {
                black_box(queue.post(&task).unwrap());
            }
            queue.drain(|t| {
                black_box(t);
            });
            post.drain();
        })
    });
}

criterion_group!(benches, bench_post_drain, bench_repost_coalesced);
criterion_main!(benches);
