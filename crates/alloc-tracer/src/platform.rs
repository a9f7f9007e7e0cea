//! External interfaces the core consumes (§6): stack bounds, monotonic
//! time, and thread/CPU identity. All of these are thin libc wrappers —
//! none of them allocate.

/// Returns `(low, high)` byte-address bounds of the calling thread's
/// user stack, or `None` if the platform query fails. This is the
/// "first-touch" operation that can genuinely fail (e.g. under memory
/// pressure `pthread_getattr_np` can fail to read `/proc/self/maps`),
/// which is what the TLS layer treats as "missing TLS" per §7 and
/// permanently disables tracking for that thread.
pub fn get_thread_stack_bounds() -> Option<(u64, u64)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || stack_addr.is_null() {
            return None;
        }
        let low = stack_addr as u64;
        let high = low + stack_size as u64;
        Some((low, high))
    }
}

/// Monotonic nanosecond timestamp, used as the ordering key into the
/// Producer Linearizer.
pub fn now_ns() -> u64 {
    unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Native thread id, cached once per thread by the TLS layer.
pub fn current_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Current CPU index, used to pick a producer slot. Falls back to 0 when
/// the platform can't answer (e.g. cgroup/affinity oddities) — the
/// Producer Linearizer degrades gracefully to a single busier producer
/// rather than erroring.
pub fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 { cpu as usize } else { 0 }
}
