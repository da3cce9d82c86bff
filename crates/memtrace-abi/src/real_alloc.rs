//! The allocator behind us in link order.
//!
//! This library exports `malloc` and friends, so calling `libc::malloc` from
//! inside it would land right back in our own symbols. The real primitives
//! are looked up with `dlsym(RTLD_NEXT, ...)` instead and cached in atomic
//! slots, resolved once per process.
//!
//! `dlsym` may itself allocate (glibc calls `calloc` for its error buffer).
//! Allocations requested while resolution is in flight are served from a
//! small static bootstrap arena. Bootstrap blocks are never returned: frees
//! of them are dropped and resizes copy them out.

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use memtrace_membrane::RealAllocator;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int;

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);

// 0=unresolved, 1=resolving, 2=resolved.
static RESOLVE_STATE: AtomicU8 = AtomicU8::new(0);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;

/// Minimum alignment the real allocator guarantees for every block.
pub const MIN_ALIGN: usize = 16;

fn lookup(slot: &AtomicUsize, name: &CStr) {
    if slot.load(Ordering::Acquire) != 0 {
        return;
    }
    // SAFETY: `name` is NUL-terminated; RTLD_NEXT is a valid pseudo-handle.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if !sym.is_null() {
        slot.store(sym as usize, Ordering::Release);
    }
}

/// Bind every real primitive. Idempotent; a call made while another
/// resolution is running returns immediately and the caller falls back to
/// the bootstrap arena.
pub fn resolve_real_functions() {
    if RESOLVE_STATE
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    lookup(&REAL_MALLOC, c"malloc");
    lookup(&REAL_CALLOC, c"calloc");
    lookup(&REAL_REALLOC, c"realloc");
    lookup(&REAL_FREE, c"free");
    lookup(&REAL_POSIX_MEMALIGN, c"posix_memalign");
    RESOLVE_STATE.store(RESOLVED, Ordering::Release);
}

#[must_use]
pub fn is_resolved() -> bool {
    RESOLVE_STATE.load(Ordering::Acquire) == RESOLVED
}

#[inline]
fn slot(slot: &AtomicUsize) -> usize {
    let f = slot.load(Ordering::Acquire);
    if f != 0 {
        return f;
    }
    if RESOLVE_STATE.load(Ordering::Acquire) == UNRESOLVED {
        resolve_real_functions();
    }
    slot.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// bootstrap arena
// ---------------------------------------------------------------------------

const BOOTSTRAP_BUF_SIZE: usize = 64 * 1024;

#[repr(C, align(16))]
struct BootstrapArena(UnsafeCell<[u8; BOOTSTRAP_BUF_SIZE]>);

// SAFETY: disjoint regions are handed out through the atomic bump cursor.
unsafe impl Sync for BootstrapArena {}

static BOOTSTRAP: BootstrapArena = BootstrapArena(UnsafeCell::new([0; BOOTSTRAP_BUF_SIZE]));
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

fn bootstrap_base() -> *mut u8 {
    BOOTSTRAP.0.get().cast::<u8>()
}

pub(crate) fn bootstrap_malloc(size: usize) -> *mut c_void {
    let Some(rounded) = size.max(1).checked_add(MIN_ALIGN - 1) else {
        return ptr::null_mut();
    };
    let rounded = rounded & !(MIN_ALIGN - 1);
    loop {
        let offset = BOOTSTRAP_USED.load(Ordering::Relaxed);
        if rounded > BOOTSTRAP_BUF_SIZE - offset {
            return ptr::null_mut();
        }
        if BOOTSTRAP_USED
            .compare_exchange_weak(offset, offset + rounded, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: offset + rounded <= BOOTSTRAP_BUF_SIZE.
            return unsafe { bootstrap_base().add(offset) }.cast();
        }
    }
}

/// Whether `ptr` points into the bootstrap arena.
#[must_use]
pub fn is_bootstrap_ptr(ptr: *const c_void) -> bool {
    let base = bootstrap_base() as usize;
    let p = ptr as usize;
    p >= base && p < base + BOOTSTRAP_BUF_SIZE
}

// ---------------------------------------------------------------------------
// real primitives
// ---------------------------------------------------------------------------

/// # Safety
///
/// Plain `malloc` contract.
pub unsafe fn malloc(size: usize) -> *mut c_void {
    match slot(&REAL_MALLOC) {
        0 => bootstrap_malloc(size),
        f => {
            // SAFETY: slot holds the address of the next `malloc`.
            let func: MallocFn = unsafe { std::mem::transmute(f) };
            unsafe { func(size) }
        }
    }
}

/// # Safety
///
/// Plain `calloc` contract.
pub unsafe fn calloc(count: usize, elem_size: usize) -> *mut c_void {
    match slot(&REAL_CALLOC) {
        0 => {
            let Some(total) = count.checked_mul(elem_size) else {
                return ptr::null_mut();
            };
            // The arena is static and never reused, so it is still zeroed.
            bootstrap_malloc(total)
        }
        f => {
            // SAFETY: slot holds the address of the next `calloc`.
            let func: CallocFn = unsafe { std::mem::transmute(f) };
            unsafe { func(count, elem_size) }
        }
    }
}

/// # Safety
///
/// `ptr` must be null, a bootstrap block, or a live block of the real
/// allocator.
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        // SAFETY: forwarded.
        return unsafe { malloc(size) };
    }
    if is_bootstrap_ptr(ptr) {
        // SAFETY: forwarded.
        let fresh = unsafe { malloc(size) };
        if !fresh.is_null() {
            let available = bootstrap_base() as usize + BOOTSTRAP_BUF_SIZE - ptr as usize;
            // SAFETY: both ranges are valid for the copied length and distinct
            // blocks never overlap.
            unsafe {
                ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), size.min(available));
            }
        }
        return fresh;
    }
    match slot(&REAL_REALLOC) {
        0 => ptr::null_mut(),
        f => {
            // SAFETY: slot holds the address of the next `realloc`.
            let func: ReallocFn = unsafe { std::mem::transmute(f) };
            unsafe { func(ptr, size) }
        }
    }
}

/// # Safety
///
/// `ptr` must be null, a bootstrap block, or a live block of the real
/// allocator.
pub unsafe fn free(ptr: *mut c_void) {
    if ptr.is_null() || is_bootstrap_ptr(ptr) {
        return;
    }
    let f = slot(&REAL_FREE);
    if f != 0 {
        // SAFETY: slot holds the address of the next `free`.
        let func: FreeFn = unsafe { std::mem::transmute(f) };
        unsafe { func(ptr) };
    }
}

/// Aligned allocation for alignments above [`MIN_ALIGN`].
///
/// # Safety
///
/// `alignment` must be a power of two and a multiple of pointer size.
pub unsafe fn memalign(alignment: usize, size: usize) -> *mut c_void {
    match slot(&REAL_POSIX_MEMALIGN) {
        0 => {
            let Some(padded) = size.checked_add(alignment - 1) else {
                return ptr::null_mut();
            };
            let raw = bootstrap_malloc(padded) as usize;
            if raw == 0 {
                return ptr::null_mut();
            }
            ((raw + alignment - 1) & !(alignment - 1)) as *mut c_void
        }
        f => {
            // SAFETY: slot holds the address of the next `posix_memalign`.
            let func: PosixMemalignFn = unsafe { std::mem::transmute(f) };
            let mut out: *mut c_void = ptr::null_mut();
            if unsafe { func(&mut out, alignment, size) } == 0 {
                out
            } else {
                ptr::null_mut()
            }
        }
    }
}

/// [`RealAllocator`] bound to the next allocator in link order.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextAllocator;

impl RealAllocator for NextAllocator {
    fn allocate(&mut self, size: usize) -> *mut c_void {
        // SAFETY: plain allocation, no pointer argument.
        unsafe { malloc(size) }
    }

    fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut c_void {
        // SAFETY: plain allocation, no pointer argument.
        unsafe { calloc(count, elem_size) }
    }

    unsafe fn resize(&mut self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: forwarded caller contract.
        unsafe { realloc(ptr, size) }
    }

    unsafe fn release(&mut self, ptr: *mut c_void) {
        // SAFETY: forwarded caller contract.
        unsafe { free(ptr) }
    }
}
