//! Installs `alloc-tracer` as the process's global allocator and drives it
//! under multi-threaded allocation/free load: several worker threads each
//! run an independent memory-access pattern while a dedicated consumer
//! thread drains sampled events off the tracker.
//!
//! Run: cargo run --release -p tracked-app

mod workload;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use alloc_tracer::{Config, ConfigBuilder, EventKind, SamplingRate};
use workload::{SawtoothPool, SteadyChurn};

// Declares the #[global_allocator] static. `alloc_tracer::install` below
// races it to populate the shared `OnceLock`; since `install` runs as the
// first statement of `main`, before any other allocation, it always wins
// and the lazy-default fallback in `tracker_or_init` never triggers.
alloc_tracer::install_tracker!();

const WORKER_THREADS: usize = 8;
const RUN_DURATION: Duration = Duration::from_secs(5);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config: Config = ConfigBuilder::new()
        .sampling_rate(SamplingRate::Every8)
        .mean_interval_bytes(64 * 1024)
        .build()
        .expect("demo config is valid");

    let tracker = alloc_tracer::install(config).expect("tracker installs exactly once");

    let allocs = Arc::new(AtomicU64::new(0));
    let frees = Arc::new(AtomicU64::new(0));

    let consumer = {
        let allocs = Arc::clone(&allocs);
        let frees = Arc::clone(&frees);
        thread::spawn(move || {
            tracker.run_consumer(|event| match event.kind {
                EventKind::Alloc => {
                    allocs.fetch_add(1, Ordering::Relaxed);
                }
                EventKind::Free => {
                    frees.fetch_add(1, Ordering::Relaxed);
                }
            });
        })
    };

    let workers: Vec<_> = (0..WORKER_THREADS)
        .map(|i| {
            thread::spawn(move || {
                let start = Instant::now();
                if i % 2 == 0 {
                    let mut pool = SawtoothPool::new();
                    while start.elapsed() < RUN_DURATION {
                        pool.tick();
                        thread::sleep(Duration::from_millis(1));
                    }
                } else {
                    let mut churn = SteadyChurn::new(4096);
                    while start.elapsed() < RUN_DURATION {
                        churn.tick();
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    tracker.request_shutdown();
    consumer.join().expect("consumer thread panicked");

    tracing::info!(
        live_addresses = tracker.live_address_count(),
        saturation = tracker.saturation_count(),
        sampled_allocs = allocs.load(Ordering::Relaxed),
        sampled_frees = frees.load(Ordering::Relaxed),
        "tracked-app run complete",
    );
    println!(
        "sampled allocs={} frees={} still-live={} saturation-drops={}",
        allocs.load(Ordering::Relaxed),
        frees.load(Ordering::Relaxed),
        tracker.live_address_count(),
        tracker.saturation_count(),
    );
}
