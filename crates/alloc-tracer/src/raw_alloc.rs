//! Raw allocator entry points (§6's `raw_malloc/raw_calloc/raw_realloc/raw_free`
//! collaborator). Under the GlobalAlloc model there is no GOT to rewrite and
//! no `dlsym(RTLD_NEXT, ...)` resolution to do — `libc::malloc` and friends
//! already name the system allocator directly, so "resolved once at
//! constructor time" collapses to these being plain `libc` calls.
//!
//! One correctness improvement over a direct `libc::malloc` call: `Layout`
//! carries an alignment requirement the plain C `malloc` doesn't promise to
//! honor above `2 * size_of::<usize>()`. Requests above that go through
//! `posix_memalign` instead, so over-aligned types allocated on this
//! allocator actually get the alignment they ask for.

use std::alloc::Layout;
use std::ptr;

const MALLOC_GUARANTEED_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// Allocates `layout.size()` bytes respecting `layout.align()`.
///
/// # Safety
/// Same contract as `GlobalAlloc::alloc`: `layout` must have non-zero size.
pub unsafe fn alloc(layout: Layout) -> *mut u8 {
    if layout.align() <= MALLOC_GUARANTEED_ALIGN {
        return unsafe { libc::malloc(layout.size()) as *mut u8 };
    }
    aligned_alloc(layout)
}

/// Allocates zero-filled memory respecting `layout.align()`.
///
/// # Safety
/// Same contract as `GlobalAlloc::alloc_zeroed`.
pub unsafe fn alloc_zeroed(layout: Layout) -> *mut u8 {
    if layout.align() <= MALLOC_GUARANTEED_ALIGN {
        return unsafe { libc::calloc(1, layout.size()) as *mut u8 };
    }
    let ptr = aligned_alloc(layout);
    if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
}

/// Frees memory previously returned by `alloc`/`alloc_zeroed`/`realloc`.
///
/// # Safety
/// `ptr` must have come from one of this module's allocation functions and
/// not already have been freed.
pub unsafe fn free(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut libc::c_void) }
}

/// Resizes a plain (non-over-aligned) allocation in place where possible.
/// Over-aligned layouts fall back to an explicit alloc-copy-free, since
/// `realloc(3)` makes no alignment guarantee beyond `malloc`'s default.
///
/// # Safety
/// Same contract as `GlobalAlloc::realloc`.
pub unsafe fn realloc(ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MALLOC_GUARANTEED_ALIGN {
        return unsafe { libc::realloc(ptr as *mut libc::c_void, new_size) as *mut u8 };
    }
    let new_layout = match Layout::from_size_align(new_size, layout.align()) {
        Ok(l) => l,
        Err(_) => return ptr::null_mut(),
    };
    let new_ptr = unsafe { alloc(new_layout) };
    if !new_ptr.is_null() {
        let copy_len = layout.size().min(new_size);
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
        unsafe { free(ptr) };
    }
    new_ptr
}

fn aligned_alloc(layout: Layout) -> *mut u8 {
    let mut out: *mut libc::c_void = ptr::null_mut();
    let align = layout.align().max(std::mem::size_of::<usize>());
    let rc = unsafe { libc::posix_memalign(&mut out, align, layout.size()) };
    if rc != 0 {
        return ptr::null_mut();
    }
    out as *mut u8
}
