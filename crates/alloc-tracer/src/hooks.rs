//! Allocation Hook Core (§4.F): the outermost layer a `GlobalAlloc` impl
//! (or, on platforms with interposition, libc/linker GOT rewriting) calls
//! into. Every function here is error-transparent per §7 — there is no
//! `Result` anywhere in this module; every failure degrades silently to
//! "no event recorded, raw allocator still called".

use std::alloc::Layout;

use crate::config;
use crate::context;
use crate::event::AllocationEvent;
use crate::platform;
use crate::raw_alloc;
use crate::sampler;
use crate::tls;
use crate::Tracker;

/// `alloc(size) -> ptr`, steps 1-10 of §4.F.
pub fn alloc(tracker: &Tracker, layout: Layout) -> *mut u8 {
    if !tls::enter_hook(true) {
        return unsafe { raw_alloc::alloc(layout) };
    }

    let ptr = unsafe { raw_alloc::alloc(layout) };
    if !ptr.is_null() {
        maybe_sample_alloc(tracker, ptr as u64, layout.size() as u64);
    }

    tls::exit_hook();
    ptr
}

/// `alloc_zeroed(size) -> ptr`. `calloc` is compositionally alloc +
/// zero-fill; `raw_alloc::alloc_zeroed` already does the zero-fill, so the
/// sampling pipeline below is identical to `alloc`'s.
pub fn alloc_zeroed(tracker: &Tracker, layout: Layout) -> *mut u8 {
    if !tls::enter_hook(true) {
        return unsafe { raw_alloc::alloc_zeroed(layout) };
    }

    let ptr = unsafe { raw_alloc::alloc_zeroed(layout) };
    if !ptr.is_null() {
        maybe_sample_alloc(tracker, ptr as u64, layout.size() as u64);
    }

    tls::exit_hook();
    ptr
}

/// `free(ptr)`, steps 1-5 of §4.F. The raw free always happens; only the
/// bookkeeping (the `should_track`/`remove`/enqueue sequence) is gated on
/// reentry.
pub fn free(tracker: &Tracker, ptr: *mut u8, layout: Layout) {
    if ptr.is_null() {
        return;
    }

    if !tls::enter_hook(false) {
        unsafe { raw_alloc::free(ptr) };
        return;
    }

    unsafe { raw_alloc::free(ptr) };
    maybe_untrack(tracker, ptr as u64);
    tls::exit_hook();
}

/// `realloc(ptr, new_size) -> new_ptr`. Defined compositionally per §4.F:
/// a free-of-old plus alloc-of-new pair, but only when the backing pointer
/// actually moves. A same-address resize leaves live-address state exactly
/// as it was; nothing further to correlate.
pub fn realloc(tracker: &Tracker, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(
            tracker,
            Layout::from_size_align(new_size, layout.align()).unwrap_or(layout),
        );
    }

    if !tls::enter_hook(true) {
        return unsafe { raw_alloc::realloc(ptr, layout, new_size) };
    }

    let new_ptr = unsafe { raw_alloc::realloc(ptr, layout, new_size) };
    if new_ptr.is_null() {
        tls::exit_hook();
        return new_ptr;
    }

    if new_ptr as u64 != ptr as u64 {
        maybe_untrack(tracker, ptr as u64);
        maybe_sample_alloc(tracker, new_ptr as u64, new_size as u64);
    }

    tls::exit_hook();
    new_ptr
}

/// Steps 5-10: the variable-rate draw, the stateless address filter, the
/// live-address insert, context capture, and enqueue onto the producer
/// ring. Must only run between a successful `enter_hook`/`exit_hook` pair.
fn maybe_sample_alloc(tracker: &Tracker, addr: u64, size: u64) {
    if !tls::should_sample(size, tracker.config.mean_interval_bytes) {
        return;
    }

    let mask = tracker.config.sampling_rate.mask();
    if !sampler::should_track(addr, mask, tracker.config.sample_policy) {
        return;
    }

    if !tracker.live_addresses.add(addr) {
        // Collision under the probe bound: stays untracked, no event.
        return;
    }

    let stack_end = tls::stack_end();
    // Stack-local, not heap: §5 forbids any allocation while the reentry
    // guard is engaged, and this runs on every sampled allocation.
    let mut buf = [0u8; config::MAX_STACK_CAPTURE_BYTES];
    let capture_buf = &mut buf[..tracker.config.stack_capture_bytes];
    let (regs, copied) = unsafe { context::capture(stack_end, capture_buf) };

    let event = AllocationEvent::alloc(tls::tid(), addr, size, size, regs, &capture_buf[..copied]);
    enqueue(tracker, addr, event);
}

/// Step 4-5 of the `free` path: the same stateless filter, then remove
/// from the Live-Address Table and enqueue a `Free` event only if the
/// address was actually live (the state machine's `add collide` path
/// never produces a paired `Free`).
fn maybe_untrack(tracker: &Tracker, addr: u64) {
    let mask = tracker.config.sampling_rate.mask();
    if !sampler::should_track(addr, mask, tracker.config.sample_policy) {
        return;
    }

    if tracker.live_addresses.remove(addr) {
        let event = AllocationEvent::free(tls::tid(), addr, 0);
        enqueue(tracker, addr, event);
    }
}

fn enqueue(tracker: &Tracker, addr: u64, event: AllocationEvent) {
    let producer = platform::current_cpu() % tracker.ring.num_producers();
    let key = platform::now_ns();
    let _ = addr;
    tracker.ring.enqueue(producer, key, event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, SamplingRate};
    use crate::Tracker;

    fn tracker() -> Tracker {
        let config = ConfigBuilder::new()
            .sampling_rate(SamplingRate::Every1)
            .shards(4)
            .shard_slots(64)
            .probe_limit(32)
            .num_producers(1)
            .build()
            .unwrap();
        Tracker::new(config)
    }

    #[test]
    fn alloc_then_free_round_trips_without_crashing() {
        let tracker = tracker();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = alloc(&tracker, layout);
        assert!(!ptr.is_null());
        free(&tracker, ptr, layout);
    }

    #[test]
    fn realloc_grows_allocation() {
        let tracker = tracker();
        let layout = Layout::from_size_align(32, 8).unwrap();
        let ptr = alloc(&tracker, layout);
        assert!(!ptr.is_null());
        let new_ptr = realloc(&tracker, ptr, layout, 128);
        assert!(!new_ptr.is_null());
        free(&tracker, new_ptr, Layout::from_size_align(128, 8).unwrap());
    }

    #[test]
    fn calloc_returns_zeroed_memory() {
        let tracker = tracker();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = alloc_zeroed(&tracker, layout);
        assert!(!ptr.is_null());
        let slice = unsafe { std::slice::from_raw_parts(ptr, 64) };
        assert!(slice.iter().all(|&b| b == 0));
        free(&tracker, ptr, layout);
    }

    // P8: a "test allocator" calling into the hook from inside the hook
    // (simulating an inner allocator call, e.g. from posix_memalign
    // internals) must not recurse — the reentry guard defers the inner
    // call to the raw allocator.
    #[test]
    fn reentrant_alloc_defers_to_raw_allocator() {
        let tracker = tracker();
        let layout = Layout::from_size_align(16, 8).unwrap();
        assert!(tls::enter_hook(true));
        let ptr = alloc(&tracker, layout);
        assert!(!ptr.is_null());
        tls::exit_hook();
        unsafe { raw_alloc::free(ptr) };
    }
}
