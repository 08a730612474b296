use std::{
    collections::VecDeque,
    sync::{Arc, Barrier, Mutex},
    thread,
};

use criterion::{black_box, Criterion, Throughput};

const THREADS: usize = 4;
const PER_THREAD: usize = 10_000;

pub fn push_pop(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("mpmc-splitref");

    group.throughput(Throughput::Elements(2));

    group.bench_function("push-pop", |b| {
        let queue = splitref::Queue::<u64>::new();

        b.iter(|| {
            queue.push(black_box(13));
            assert_eq!(Some(13), queue.pop());
        });
    });
}

pub fn std_push_pop(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("mpmc-std-mutex");

    group.throughput(Throughput::Elements(2));

    group.bench_function("push-pop", |b| {
        let queue = Mutex::new(VecDeque::<u64>::new());

        b.iter(|| {
            queue.lock().unwrap().push_back(black_box(13));
            assert_eq!(Some(13), queue.lock().unwrap().pop_front());
        });
    });
}

/// Runs `THREADS` Threads, that each alternate between pushing and popping
fn run_concurrent<Q, P, C>(queue: Arc<Q>, push: P, pop: C)
where
    Q: Send + Sync + 'static,
    P: Fn(&Q, u64) + Send + Sync + Copy + 'static,
    C: Fn(&Q) -> Option<u64> + Send + Sync + Copy + 'static,
{
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = queue.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..PER_THREAD {
                    push(&queue, i as u64);
                    black_box(pop(&queue));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

pub fn concurrent_push_pop(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("mpmc-splitref");

    group.throughput(Throughput::Elements((THREADS * PER_THREAD * 2) as u64));

    group.bench_function("concurrent-push-pop", |b| {
        b.iter(|| {
            run_concurrent(
                Arc::new(splitref::Queue::<u64>::new()),
                |queue, value| queue.push(value),
                |queue| queue.pop(),
            );
        });
    });
}

pub fn std_concurrent_push_pop(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("mpmc-std-mutex");

    group.throughput(Throughput::Elements((THREADS * PER_THREAD * 2) as u64));

    group.bench_function("concurrent-push-pop", |b| {
        b.iter(|| {
            run_concurrent(
                Arc::new(Mutex::new(VecDeque::<u64>::new())),
                |queue, value| queue.lock().unwrap().push_back(value),
                |queue| queue.lock().unwrap().pop_front(),
            );
        });
    });
}
