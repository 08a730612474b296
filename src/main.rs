use std::{
    convert::TryFrom,
    sync::{atomic, Arc},
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use splitref::Queue;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Runs a Producer/Consumer Stress-Run against the Queue
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// The Number of Threads pushing into the Queue
    #[arg(long, default_value_t = 4)]
    producers: usize,
    /// The Number of Threads popping from the Queue
    #[arg(long, default_value_t = 4)]
    consumers: usize,
    /// The Number of Elements pushed by every Producer
    #[arg(long, default_value_t = 1_000_000)]
    iterations: usize,
}

/// Splits the Duration evenly across `count` Elements, without truncating
/// counts that don't fit into a `u32`
fn per_element(duration: Duration, count: usize) -> Duration {
    match u32::try_from(count.max(1)) {
        Ok(count) => duration / count,
        Err(_) => duration.div_f64(count as f64),
    }
}

pub fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "splitref=info,splitref_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(
        producers = args.producers,
        consumers = args.consumers,
        iterations = args.iterations,
        lock_free = Queue::<u64>::is_lock_free(),
        "starting run"
    );

    let queue = Arc::new(Queue::new());
    let expected = args.producers * args.iterations;
    let received = Arc::new(atomic::AtomicUsize::new(0));

    let start = Instant::now();

    let producers: Vec<_> = (0..args.producers)
        .map(|id| {
            let queue = queue.clone();
            let iterations = args.iterations;
            thread::spawn(move || {
                let start = Instant::now();
                for i in 0..iterations {
                    queue.push((id * iterations + i) as u64);
                }
                let duration = start.elapsed();
                let per_push = per_element(duration, iterations);

                tracing::info!(
                    producer = id,
                    ?duration,
                    ?per_push,
                    "producer done"
                );
            })
        })
        .collect();

    let consumers: Vec<_> = (0..args.consumers)
        .map(|id| {
            let queue = queue.clone();
            let received = received.clone();
            thread::spawn(move || {
                let mut popped = 0usize;
                while received.load(atomic::Ordering::Acquire) < expected {
                    if queue.pop().is_some() {
                        popped += 1;
                        received.fetch_add(1, atomic::Ordering::AcqRel);
                    }
                }

                tracing::info!(consumer = id, popped, "consumer done");
            })
        })
        .collect();

    for handle in producers.into_iter().chain(consumers) {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }

    tracing::info!(
        received = received.load(atomic::Ordering::Acquire),
        expected,
        duration = ?start.elapsed(),
        "run finished"
    );
}
