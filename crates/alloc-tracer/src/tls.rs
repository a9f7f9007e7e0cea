//! Thread-Local State (§4.C): one instance per OS thread, created on
//! first hook entry, carrying the reentry guard, the variable-rate
//! sampler's running counter, cached stack bounds, and the per-thread
//! PRNG.
//!
//! The state lives in a `Cell` behind a `const`-initialized
//! `thread_local!`, so first touch is a plain zero-cost memory write —
//! it cannot itself allocate or fail. That structurally forecloses the
//! "missing TLS: first-touch construction failed (e.g. OOM)" failure
//! mode §7 names for the general case; the one real first-touch failure
//! left on this platform, `get_thread_stack_bounds` failing, is handled
//! explicitly below and modeled as the same taxonomy entry (see
//! `DESIGN.md`).

use std::cell::Cell;

use crate::platform;

/// Lehmer / Park-Miller MINSTD constants (`include/prng.hpp`'s sibling
/// generator, `allocation_tracker_tls.hpp`'s `std::minstd_rand`).
const LCG_MULTIPLIER: u64 = 48_271;
const LCG_MODULUS: u64 = (1u64 << 31) - 1;

#[derive(Clone, Copy)]
struct TrackerState {
    remaining_bytes: i64,
    remaining_bytes_initialized: bool,
    stack_lo: u64,
    stack_hi: u64,
    stack_bounds_ready: bool,
    tid: u32,
    tid_ready: bool,
    reentry_guard: bool,
    allocation_allowed: bool,
    /// Permanently disables tracking for this thread after a first-touch
    /// failure (stack bounds unavailable) — the "missing TLS" path.
    disabled: bool,
    rng_state: u64,
}

impl TrackerState {
    const fn new() -> Self {
        TrackerState {
            remaining_bytes: 0,
            remaining_bytes_initialized: false,
            stack_lo: 0,
            stack_hi: 0,
            stack_bounds_ready: false,
            tid: 0,
            tid_ready: false,
            reentry_guard: false,
            allocation_allowed: true,
            disabled: false,
            rng_state: 0,
        }
    }
}

thread_local! {
    static STATE: Cell<TrackerState> = const { Cell::new(TrackerState::new()) };
}

fn with_state<R>(f: impl FnOnce(&mut TrackerState) -> R) -> R {
    STATE.with(|cell| {
        let mut state = cell.get();
        let result = f(&mut state);
        cell.set(state);
        result
    })
}

fn ensure_first_touch(state: &mut TrackerState) -> bool {
    if state.disabled {
        return false;
    }
    if state.tid_ready {
        return true;
    }
    match platform::get_thread_stack_bounds() {
        Some((lo, hi)) => {
            state.stack_lo = lo;
            state.stack_hi = hi;
            state.stack_bounds_ready = true;
            state.tid = platform::current_tid();
            state.tid_ready = true;
            let seed = platform::now_ns() ^ (state.tid as u64);
            state.rng_state = (seed % LCG_MODULUS).max(1);
            true
        }
        None => {
            state.disabled = true;
            false
        }
    }
}

/// Enters a hook that may perform a tracked allocation. Returns `false`
/// if the hook must defer entirely to the raw allocator: either the
/// reentry guard is already engaged, this thread's TLS permanently
/// failed first touch, or `allocation_allowed` has been cleared for a
/// path that must not recurse into the allocator.
pub fn enter_hook(require_allocation_allowed: bool) -> bool {
    with_state(|state| {
        if !ensure_first_touch(state) {
            return false;
        }
        if state.reentry_guard {
            return false;
        }
        if require_allocation_allowed && !state.allocation_allowed {
            return false;
        }
        state.reentry_guard = true;
        true
    })
}

/// Clears the reentry guard on every exit path from a hook that
/// successfully called `enter_hook`.
pub fn exit_hook() {
    with_state(|state| state.reentry_guard = false);
}

/// Runs the variable-rate sampling decision for a request of `size`
/// bytes, returning `true` if this allocation should be sampled. Must
/// only be called between `enter_hook`/`exit_hook`.
pub fn should_sample(size: u64, mean_interval_bytes: u64) -> bool {
    with_state(|state| {
        if !state.remaining_bytes_initialized {
            state.remaining_bytes = draw_interval(&mut state.rng_state, mean_interval_bytes);
            state.remaining_bytes_initialized = true;
        }
        state.remaining_bytes -= size as i64;
        if state.remaining_bytes > 0 {
            return false;
        }
        state.remaining_bytes = draw_interval(&mut state.rng_state, mean_interval_bytes);
        true
    })
}

/// Cached native thread id. Only valid to call after a successful
/// `enter_hook`.
pub fn tid() -> u32 {
    with_state(|state| state.tid)
}

/// Cached upper bound of this thread's stack, for `context::capture`.
pub fn stack_end() -> u64 {
    with_state(|state| state.stack_hi)
}

/// Disables tracked-allocation bookkeeping on this thread (but not raw
/// allocation) for the duration of a scope — used around paths that must
/// not themselves trigger a sampled allocation, e.g. while the mmap hook
/// this crate doesn't implement might be re-entered by the platform
/// allocator.
pub fn with_allocation_disallowed<R>(f: impl FnOnce() -> R) -> R {
    let previous = with_state(|state| std::mem::replace(&mut state.allocation_allowed, false));
    let result = f();
    with_state(|state| state.allocation_allowed = previous);
    result
}

/// Draws the next sampling interval from `Exp(lambda = 1/mean)` via
/// `-mean * ln(U)` with `U` in `(0, 1)` from the thread's LCG.
fn draw_interval(rng_state: &mut u64, mean: u64) -> i64 {
    *rng_state = (*rng_state * LCG_MULTIPLIER) % LCG_MODULUS;
    let u = (*rng_state as f64 + 1.0) / (LCG_MODULUS as f64 + 1.0);
    let interval = -(mean as f64) * u.ln();
    if interval.is_finite() && interval > 0.0 {
        interval as i64
    } else {
        mean as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_hook_sets_and_exit_clears_guard() {
        assert!(enter_hook(false));
        // Nested entry is rejected while the guard is held.
        assert!(!enter_hook(false));
        exit_hook();
        assert!(enter_hook(false));
        exit_hook();
    }

    #[test]
    fn allocation_disallowed_blocks_entry_when_required() {
        with_allocation_disallowed(|| {
            assert!(!enter_hook(true));
            assert!(enter_hook(false));
            exit_hook();
        });
    }

    #[test]
    fn draw_interval_is_positive_and_varies() {
        let mut rng_state = 42u64;
        let a = draw_interval(&mut rng_state, 1000);
        let b = draw_interval(&mut rng_state, 1000);
        assert!(a > 0);
        assert!(b > 0);
        assert_ne!(a, b);
    }

    #[test]
    fn should_sample_eventually_fires() {
        assert!(enter_hook(false));
        let mut fired = false;
        for _ in 0..10_000 {
            if should_sample(64, 1024) {
                fired = true;
                break;
            }
        }
        exit_hook();
        assert!(fired, "sampling never triggered over many allocations");
    }
}
