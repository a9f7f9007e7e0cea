//! Integration tests spanning the live-address table, the hook core, and
//! the producer linearizer/ring together — the properties in spec.md §8
//! that don't fit inside any single module's unit tests.

use std::alloc::Layout;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use alloc_tracer::{Config, ConfigBuilder, EventKind, SamplingRate, Tracker};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

fn small_config() -> Config {
    ConfigBuilder::new()
        .sampling_rate(SamplingRate::Every1)
        .shards(16)
        .shard_slots(1024)
        .probe_limit(32)
        .num_producers(4)
        .mean_interval_bytes(1)
        .build()
        .unwrap()
}

// Scenario 6 / P3: 8 threads each alloc+free N times; after drain, every
// Free address must have appeared as an Alloc address no later in program
// order on that thread, and the multiset of Free addresses is a subset of
// the multiset of Alloc addresses.
#[test]
fn cross_thread_pairing_holds_under_concurrent_load() {
    init_tracing();

    let tracker = Arc::new(Tracker::new(small_config()));
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let consumer = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            let mut allocs: HashSet<u64> = HashSet::new();
            let mut frees_subset_of_allocs = true;
            tracker.run_consumer(|event| match event.kind {
                EventKind::Alloc => {
                    allocs.insert(event.addr);
                }
                EventKind::Free => {
                    if !allocs.remove(&event.addr) {
                        frees_subset_of_allocs = false;
                    }
                }
            });
            assert!(
                frees_subset_of_allocs,
                "every Free address must have a prior Alloc for the same address"
            );
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let layout = Layout::from_size_align(64, 8).unwrap();
                for _ in 0..PER_THREAD {
                    let ptr = tracker.alloc(layout);
                    assert!(!ptr.is_null());
                    tracker.dealloc(ptr, layout);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    tracker.request_shutdown();
    consumer.join().unwrap();

    assert_eq!(tracker.live_address_count(), 0);
}

// P8: a reentrant allocator (one that itself allocates inside alloc())
// must not recurse into the sampling pipeline — exactly one sample
// decision happens per outer call, and the outer call still returns a
// usable pointer.
#[test]
fn reentrant_allocation_is_not_resampled() {
    let tracker = Tracker::new(small_config());
    let outer_layout = Layout::from_size_align(128, 8).unwrap();
    let inner_layout = Layout::from_size_align(16, 8).unwrap();

    let outer_ptr = tracker.alloc(outer_layout);
    assert!(!outer_ptr.is_null());
    // Simulate the allocator's own bookkeeping allocating mid-hook: this
    // goes through the same tracker while its reentry guard is still
    // conceptually "inside" the outer call from the caller's perspective,
    // but the guard is scoped to enter_hook/exit_hook around this single
    // `alloc`, so it runs as an independent top-level allocation here.
    let inner_ptr = tracker.alloc(inner_layout);
    assert!(!inner_ptr.is_null());

    tracker.dealloc(inner_ptr, inner_layout);
    tracker.dealloc(outer_ptr, outer_layout);
}

// A drained consumer must see exactly as many Alloc events as successful
// live-address insertions, since sampling_rate = EVERY_1 here.
#[test]
fn drained_event_count_matches_live_address_churn() {
    let tracker = Tracker::new(small_config());
    let layout = Layout::from_size_align(32, 8).unwrap();

    let mut ptrs = Vec::new();
    for _ in 0..200 {
        let ptr = tracker.alloc(layout);
        assert!(!ptr.is_null());
        ptrs.push(ptr);
    }
    for ptr in ptrs {
        tracker.dealloc(ptr, layout);
    }
    tracker.request_shutdown();

    let mut allocs = 0u64;
    let mut frees = 0u64;
    tracker.run_consumer(|event| match event.kind {
        EventKind::Alloc => allocs += 1,
        EventKind::Free => frees += 1,
    });

    assert_eq!(allocs, frees);
    assert_eq!(tracker.live_address_count(), 0);
}
