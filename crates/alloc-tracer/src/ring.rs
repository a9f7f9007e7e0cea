//! The concrete per-CPU producer ring (§1's "per-CPU lock-free ring",
//! §4.E's Producer Linearizer made realistic). Each producer index owns
//! a small single-producer/single-consumer ring of `AllocationEvent`s;
//! the Producer Linearizer merges their heads into one value-ordered
//! drain sequence, keyed on `now_ns()`.
//!
//! Hook threads only ever touch `SpscRing::push` and two atomics — both
//! wait-free, matching §5's "no hook ever blocks the caller". All
//! sorting/merging work happens on the consumer thread that calls
//! `EventRing::drain_one`, which is explicitly not under the hook's
//! signal-safety constraints.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use crate::event::AllocationEvent;
use crate::linearizer::ProducerLinearizer;

struct QueuedEvent {
    key: u64,
    event: AllocationEvent,
}

/// A bounded single-producer/single-consumer ring buffer. `cap` must be a
/// power of two. Push never blocks: a full ring simply rejects the new
/// element, which `EventRing::enqueue` treats as the §7 "transient
/// saturation"-style silent drop.
///
/// `head`/`tail` are each `CachePadded`: the producer (an allocation hook,
/// potentially on any thread) writes `tail` while the consumer thread
/// writes `head`, and without padding the two would share a cache line,
/// turning every push/pop pair into unnecessary cross-core contention.
struct SpscRing<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    fn new(cap: usize) -> Self {
        assert!(cap.is_power_of_two());
        let buf = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        SpscRing {
            buf,
            mask: cap - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Producer-side push. Safe to call from multiple threads only if
    /// the caller guarantees they never run concurrently with each other
    /// (true here: at most one hook thread is ever active per CPU index
    /// at a time).
    fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            return Err(value);
        }
        let idx = tail & self.mask;
        unsafe { (*self.buf[idx].get()).write(value) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer-side peek at the head element without removing it. Only
    /// valid when called by the single consumer thread.
    fn peek(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head & self.mask;
        Some(unsafe { (*self.buf[idx].get()).assume_init_ref() })
    }

    /// Consumer-side pop. Only valid when called by the single consumer
    /// thread.
    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head & self.mask;
        let value = unsafe { (*self.buf[idx].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

struct LinearizerGuard {
    linearizer: ProducerLinearizer,
}

/// Owns `num_producers` per-CPU rings and the Producer Linearizer that
/// merges them. `enqueue` is the only method called from a hook; it is
/// wait-free. `drain_one` is called from the dedicated consumer thread.
pub struct EventRing {
    queues: Box<[SpscRing<QueuedEvent>]>,
    values: Arc<[AtomicU64]>,
    pending: Box<[AtomicBool]>,
    guard: Mutex<LinearizerGuard>,
}

const NO_VALUE: u64 = u64::MAX;

impl EventRing {
    pub fn new(num_producers: usize, ring_capacity: usize) -> Self {
        let num_producers = num_producers.max(1);
        let ring_capacity = ring_capacity.next_power_of_two().max(2);

        let queues = (0..num_producers)
            .map(|_| SpscRing::new(ring_capacity))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let values: Arc<[AtomicU64]> = (0..num_producers)
            .map(|_| AtomicU64::new(NO_VALUE))
            .collect::<Vec<_>>()
            .into();
        let pending = (0..num_producers)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let linearizer = ProducerLinearizer::new(values.clone());

        EventRing {
            queues,
            values,
            pending,
            guard: Mutex::new(LinearizerGuard { linearizer }),
        }
    }

    pub fn num_producers(&self) -> usize {
        self.queues.len()
    }

    /// Enqueues `event` under producer slot `producer % num_producers`,
    /// keyed by `key` (a `now_ns()` reading) for later value-ordered
    /// drain. Wait-free: at most a bounded CAS-free push plus, on an
    /// empty-to-nonempty transition, two atomic stores.
    pub fn enqueue(&self, producer: usize, key: u64, event: AllocationEvent) {
        let idx = producer % self.queues.len();
        let queue = &self.queues[idx];
        let was_empty = queue.is_empty();
        if queue.push(QueuedEvent { key, event }).is_err() {
            // Ring full under this producer's current load: drop, same
            // as any other silent §7 saturation failure.
            return;
        }
        if was_empty {
            self.values[idx].store(key, Ordering::Release);
            self.pending[idx].store(true, Ordering::Release);
        }
    }

    /// Drains and returns the next event in value order, or `None` if
    /// every producer is currently empty. Must only be called by a
    /// single consumer thread (the lock exists to make `EventRing` a
    /// plain `Sync` type, not to allow concurrent consumers).
    pub fn drain_one(&self) -> Option<AllocationEvent> {
        let mut guard = self.guard.lock().unwrap();

        for idx in 0..self.queues.len() {
            if self.pending[idx].swap(false, Ordering::AcqRel) {
                guard.linearizer.push(idx as u64);
            }
        }

        let idx = guard.linearizer.pop()? as usize;
        let queued = self.queues[idx].pop()?;

        if let Some(next) = self.queues[idx].peek() {
            self.values[idx].store(next.key, Ordering::Release);
            guard.linearizer.push(idx as u64);
        }

        Some(queued.event)
    }

    /// Approximate count of events sitting in producer rings, for tests
    /// and shutdown draining.
    pub fn has_pending(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }
}
