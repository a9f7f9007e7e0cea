//! Lock-free allocation sampling core: stateless address sampling, a
//! lock-free live-address table, per-thread context capture, and a
//! value-ordered producer ring feeding a drain-side consumer callback.
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! alloc-tracer = { version = "0.1", features = ["global"] }
//! ```
//!
//! Install the tracker as your process's global allocator and start the
//! consumer loop:
//! ```rust,ignore
//! alloc_tracer::install_tracker!(config = alloc_tracer::Config::default());
//!
//! fn main() {
//!     let tracker = alloc_tracer::install(alloc_tracer::Config::default())
//!         .expect("tracker installed exactly once");
//!     std::thread::spawn(move || {
//!         tracker.run_consumer(|event| {
//!             println!("{:?}", event);
//!         });
//!     });
//!     // ... application code, allocations now sampled ...
//!     tracker.request_shutdown();
//! }
//! ```
//!
//! When the `global` feature is disabled, `TrackedAllocator` is a
//! zero-overhead passthrough to the system allocator and `install_tracker!`
//! expands to nothing.

mod config;
mod context;
mod error;
mod event;
mod hooks;
mod linearizer;
mod live_addresses;
mod platform;
mod raw_alloc;
mod ring;
mod sampler;
mod tls;

pub use config::{Config, ConfigBuilder, SamplePolicy, SamplingRate, MAX_STACK_CAPTURE_BYTES};
pub use error::{Error, Result};
pub use event::{AllocationEvent, EventKind};

use std::alloc::Layout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use live_addresses::LiveAddressTable;
use ring::EventRing;

/// Owns the Live-Address Table and the producer ring backing one
/// installation of the tracker. Config is frozen at construction (§9:
/// "immutable config frozen at init").
pub struct Tracker {
    config: Config,
    live_addresses: LiveAddressTable,
    ring: EventRing,
    shutdown: AtomicBool,
}

impl Tracker {
    pub fn new(config: Config) -> Self {
        // The only diagnostic this crate ever logs from non-hook context
        // (§7: "a single log-once diagnostic may be emitted from non-hook
        // context") — never on the alloc/free path itself.
        tracing::info!(
            sampling_rate = config.sampling_rate.rate(),
            shards = config.shards,
            shard_slots = config.shard_slots,
            num_producers = config.num_producers,
            "alloc-tracer installing",
        );
        let live_addresses =
            LiveAddressTable::new(config.shards, config.shard_slots, config.probe_limit);
        let ring = EventRing::new(config.num_producers, config.producer_ring_capacity);
        Tracker {
            config,
            live_addresses,
            ring,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of addresses currently believed live across all shards.
    pub fn live_address_count(&self) -> u64 {
        self.live_addresses.count()
    }

    /// Number of `add` calls that gave up under saturation so far.
    pub fn saturation_count(&self) -> u64 {
        self.live_addresses.saturation_count()
    }

    pub fn alloc(&self, layout: Layout) -> *mut u8 {
        hooks::alloc(self, layout)
    }

    pub fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        hooks::alloc_zeroed(self, layout)
    }

    pub fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        hooks::free(self, ptr, layout)
    }

    pub fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        hooks::realloc(self, ptr, layout, new_size)
    }

    /// The consumer loop (§6: "a callback `on_event(event)` fired from the
    /// consumer that drains the Producer Linearizer"). Intended to run on
    /// a dedicated, non-hook thread; blocks this thread until
    /// `request_shutdown` is called and every producer ring has drained.
    pub fn run_consumer(&self, mut on_event: impl FnMut(AllocationEvent)) {
        loop {
            match self.ring.drain_one() {
                Some(event) => on_event(event),
                None => {
                    if self.shutdown.load(Ordering::Acquire) && !self.ring.has_pending() {
                        tracing::debug!("alloc-tracer consumer drained, exiting");
                        return;
                    }
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    /// Asks `run_consumer` to drain whatever remains queued and return
    /// (§6: "a shutdown entry point that asks the consumer thread to
    /// drain and exit").
    pub fn request_shutdown(&self) {
        tracing::debug!("alloc-tracer shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }
}

static TRACKER: OnceLock<Tracker> = OnceLock::new();

/// Installs the process-wide tracker with `config`. Returns
/// `Error::AlreadyInstalled` if called more than once. Typically invoked
/// only through `install_tracker!`.
pub fn install(config: Config) -> Result<&'static Tracker> {
    TRACKER
        .set(Tracker::new(config))
        .map_err(|_| Error::AlreadyInstalled)?;
    Ok(TRACKER.get().expect("just installed"))
}

/// The process-wide tracker, if `install`/`install_tracker!` has run.
pub fn tracker() -> Option<&'static Tracker> {
    TRACKER.get()
}

/// The `#[global_allocator]`-compatible front door. Delegates to the
/// process-wide `Tracker` once `install`/`install_tracker!` has run;
/// before that (and always, when the `global` feature is off) it is a
/// direct passthrough to the raw allocator.
pub struct TrackedAllocator;

#[cfg(not(feature = "global"))]
mod disabled {
    use super::TrackedAllocator;
    use crate::raw_alloc;
    use std::alloc::{GlobalAlloc, Layout};

    unsafe impl GlobalAlloc for TrackedAllocator {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { raw_alloc::alloc(layout) }
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            unsafe { raw_alloc::free(ptr) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            unsafe { raw_alloc::realloc(ptr, layout, new_size) }
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { raw_alloc::alloc_zeroed(layout) }
        }
    }
}

#[cfg(feature = "global")]
mod enabled {
    use super::{Config, Tracker, TrackedAllocator, TRACKER};
    use crate::raw_alloc;
    use std::alloc::{GlobalAlloc, Layout};

    /// Resolves the process-wide tracker, lazily installing it with a
    /// default `Config` on first use, so profiling starts automatically on
    /// the first allocation rather than needing a separate constructor
    /// function to run before `main`. `install`/`install_tracker!(config =
    /// ..)` still wins if it runs first; this is only the fallback for the
    /// plain `install_tracker!()` form.
    #[inline]
    fn tracker_or_init() -> &'static Tracker {
        TRACKER.get_or_init(|| Tracker::new(Config::default()))
    }

    unsafe impl GlobalAlloc for TrackedAllocator {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            tracker_or_init().alloc(layout)
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            match TRACKER.get() {
                Some(tracker) => tracker.dealloc(ptr, layout),
                None => unsafe { raw_alloc::free(ptr) },
            }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            tracker_or_init().realloc(ptr, layout, new_size)
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            tracker_or_init().alloc_zeroed(layout)
        }
    }
}

/// Installs the tracker as the process's `#[global_allocator]`. With no
/// arguments the tracker lazily builds a default `Config` on first
/// allocation — profiling starts automatically, no constructor function
/// needed. `install_tracker!(config = expr)` instead declares the
/// allocator and expects the caller to run `alloc_tracer::install(expr)`
/// as the very first statement of `main` — whichever of the two installs
/// first wins, since both funnel through the same `OnceLock`.
/// A zero-cost no-op when the `global` feature is disabled.
#[macro_export]
#[cfg(feature = "global")]
macro_rules! install_tracker {
    () => {
        #[global_allocator]
        static __ALLOC_TRACER: $crate::TrackedAllocator = $crate::TrackedAllocator;
    };
    (config = $config:expr) => {
        #[global_allocator]
        static __ALLOC_TRACER: $crate::TrackedAllocator = $crate::TrackedAllocator;
    };
}

#[macro_export]
#[cfg(not(feature = "global"))]
macro_rules! install_tracker {
    () => {};
    (config = $config:expr) => {
        let _ = $config;
    };
}
