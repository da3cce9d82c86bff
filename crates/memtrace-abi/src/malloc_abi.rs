//! Exported allocator entry points.
//!
//! Each entry takes the reentry guard, hands the call to the process tracer,
//! and falls back to the real allocator when the thread is already inside the
//! tracer or no tracer is live. Blocks returned on the nested path are kept in
//! the [`untracked`](crate::untracked) table so their frees are forwarded
//! instead of reported.

use std::ffi::c_void;

use crate::lifecycle::{enter_allocator_reentry_guard, with_tracer};
use crate::{real_alloc, untracked};

/// Remember a block the ledger will never see.
#[inline]
fn untraced(ptr: *mut c_void) -> *mut c_void {
    if !ptr.is_null() && !real_alloc::is_bootstrap_ptr(ptr) {
        untracked::remember(ptr as usize);
    }
    ptr
}

/// A block the tracer just recorded cannot also be untracked.
#[inline]
fn traced(ptr: *mut c_void) -> *mut c_void {
    if !ptr.is_null() {
        untracked::forget(ptr as usize);
    }
    ptr
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory and
/// records the block in the allocation ledger.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(any(test, debug_assertions)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the tracer to avoid allocator recursion.
        return untraced(unsafe { real_alloc::malloc(size) });
    };
    match with_tracer(|tracer| tracer.allocate(size)) {
        Some(ptr) => traced(ptr),
        // SAFETY: no tracer live; plain forward.
        None => unsafe { real_alloc::malloc(size) },
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// POSIX `free` -- releases a block.
///
/// Null is a no-op. Blocks the ledger never handed out, and blocks already
/// released, are reported and NOT passed to the real allocator. Blocks
/// allocated on the tracer's nested path are forwarded silently.
///
/// # Safety
///
/// `ptr` should have been returned by `malloc`, `calloc` or `realloc`.
#[cfg_attr(not(any(test, debug_assertions)), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || real_alloc::is_bootstrap_ptr(ptr) {
        return;
    }
    if untracked::forget(ptr as usize) {
        // SAFETY: handed out by the real allocator on the nested path.
        unsafe { real_alloc::free(ptr) };
        return;
    }
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the tracer to avoid allocator recursion.
        unsafe { real_alloc::free(ptr) };
        return;
    };
    // SAFETY: the tracer only forwards pointers its ledger holds as live.
    if with_tracer(|tracer| unsafe { tracer.release(ptr) }).is_none() {
        // SAFETY: no tracer live; plain forward.
        unsafe { real_alloc::free(ptr) };
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// POSIX `calloc` -- allocates a zeroed array of `nmemb` elements of `size`
/// bytes.
///
/// Returns null if the multiplication overflows or allocation fails.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(not(any(test, debug_assertions)), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the tracer to avoid allocator recursion.
        return untraced(unsafe { real_alloc::calloc(nmemb, size) });
    };
    match with_tracer(|tracer| tracer.zero_allocate(nmemb, size)) {
        Some(ptr) => traced(ptr),
        // SAFETY: no tracer live; plain forward.
        None => unsafe { real_alloc::calloc(nmemb, size) },
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Resize a block the ledger does not know about and keep it untracked.
///
/// # Safety
///
/// `ptr` must be null, a bootstrap block, or a live block of the real
/// allocator.
unsafe fn realloc_untraced(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let fresh = unsafe { real_alloc::realloc(ptr, size) };
    if fresh.is_null() && size != 0 && !ptr.is_null() {
        // Failed: the old block is still ours to hand back later.
        untraced(ptr);
    }
    untraced(fresh)
}

/// POSIX `realloc` -- changes the size of a block.
///
/// - If `ptr` is null, behaves like `malloc(size)`.
/// - If the real allocator fails, the old block stays live and null is
///   returned.
/// - Bootstrap blocks and blocks from the nested path are resized without
///   being traced; the result stays untracked.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by `malloc`/`calloc`/`realloc`.
#[cfg_attr(not(any(test, debug_assertions)), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if real_alloc::is_bootstrap_ptr(ptr) || untracked::forget(ptr as usize) {
        // SAFETY: the block never entered the ledger.
        return unsafe { realloc_untraced(ptr, size) };
    }
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path bypasses the tracer to avoid allocator recursion.
        return unsafe { realloc_untraced(ptr, size) };
    };
    // SAFETY: forwarded caller contract.
    match with_tracer(|tracer| unsafe { tracer.resize(ptr, size) }) {
        Some(new_ptr) => traced(new_ptr),
        // SAFETY: no tracer live; plain forward.
        None => unsafe { real_alloc::realloc(ptr, size) },
    }
}
