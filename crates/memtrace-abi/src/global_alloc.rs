//! Rust-side allocator for the tracer itself.
//!
//! `System` would call `malloc`, which resolves to our own export. Routing
//! through the real primitives keeps the ledger, sink buffers and JSON
//! encoding out of the trace.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;

use crate::real_alloc::{self, MIN_ALIGN};

pub struct NextInChain;

#[inline]
fn fits_plain(layout: &Layout) -> bool {
    layout.align() <= MIN_ALIGN && layout.align() <= layout.size()
}

unsafe impl GlobalAlloc for NextInChain {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if fits_plain(&layout) {
            unsafe { real_alloc::malloc(layout.size()) }.cast()
        } else {
            let align = layout.align().max(std::mem::size_of::<usize>());
            unsafe { real_alloc::memalign(align, layout.size()) }.cast()
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if fits_plain(&layout) {
            return unsafe { real_alloc::calloc(1, layout.size()) }.cast();
        }
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { real_alloc::free(ptr.cast::<c_void>()) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: caller guarantees new_size rounded to align does not overflow.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        if fits_plain(&new_layout) {
            return unsafe { real_alloc::realloc(ptr.cast(), new_size) }.cast();
        }
        let fresh = unsafe { self.alloc(new_layout) };
        if !fresh.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        fresh
    }
}

#[global_allocator]
static GLOBAL: NextInChain = NextInChain;
