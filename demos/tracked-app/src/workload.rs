//! Allocation workloads that drive the tracker under realistic load: a
//! pool that grows in fixed chunks and periodically flushes (`SawtoothPool`)
//! and a steady churn of same-size alloc/free pairs (`SteadyChurn`), which
//! together exercise both the size-based sampler draw and repeated
//! add/remove cycles in the live-address table.

use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 256 * 1024;
const FLUSH_THRESHOLD: usize = 8 * 1024 * 1024;
const ALLOC_INTERVAL: Duration = Duration::from_millis(20);

/// Ramps up by `CHUNK_SIZE` on a timer, then drops everything once
/// `FLUSH_THRESHOLD` is crossed — the allocate/flush idiom from
/// `BufferPool::tick`.
pub struct SawtoothPool {
    buffers: Vec<Vec<u8>>,
    total_bytes: usize,
    last_alloc: Instant,
}

impl SawtoothPool {
    pub fn new() -> Self {
        SawtoothPool {
            buffers: Vec::new(),
            total_bytes: 0,
            last_alloc: Instant::now() - ALLOC_INTERVAL,
        }
    }

    pub fn tick(&mut self) {
        if self.last_alloc.elapsed() >= ALLOC_INTERVAL {
            self.allocate_chunk();
            self.last_alloc = Instant::now();
        }
        if self.total_bytes >= FLUSH_THRESHOLD {
            self.flush();
        }
    }

    #[inline(never)]
    fn allocate_chunk(&mut self) {
        let chunk = vec![0xABu8; CHUNK_SIZE];
        self.total_bytes += chunk.len();
        self.buffers.push(chunk);
    }

    #[inline(never)]
    fn flush(&mut self) {
        self.buffers.clear();
        self.total_bytes = 0;
    }
}

/// Repeatedly allocates and immediately frees a small buffer. With the
/// tracker installed this exercises the paired add/remove path on every
/// tick rather than the sawtooth's longer-lived retained buffers.
pub struct SteadyChurn {
    size: usize,
}

impl SteadyChurn {
    pub fn new(size: usize) -> Self {
        SteadyChurn { size }
    }

    #[inline(never)]
    pub fn tick(&mut self) {
        let buf = vec![0u8; self.size];
        std::hint::black_box(&buf);
        drop(buf);
    }
}
