#![no_main]
//! Arbitrary malloc/calloc/realloc/free sequences, including frees of
//! garbage and already-freed pointers, against a synthetic allocator. The
//! accounting identity must hold after every step and rejected frees must
//! never reach the allocator.

use std::collections::HashSet;
use std::ffi::c_void;

use libfuzzer_sys::fuzz_target;
use memtrace_membrane::{NullSink, RealAllocator, TracerConfig, TracerState};

#[derive(Default)]
struct Synthetic {
    next: usize,
    free_list: Vec<usize>,
    outstanding: HashSet<usize>,
}

impl Synthetic {
    fn take(&mut self) -> *mut c_void {
        let addr = self.free_list.pop().unwrap_or_else(|| {
            self.next += 16;
            0x1000_0000 + self.next
        });
        self.outstanding.insert(addr);
        addr as *mut c_void
    }

    fn give_back(&mut self, addr: usize) {
        assert!(self.outstanding.remove(&addr), "forwarded a block we do not own: {addr:#x}");
        self.free_list.push(addr);
    }
}

impl RealAllocator for Synthetic {
    fn allocate(&mut self, _size: usize) -> *mut c_void {
        self.take()
    }

    fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut c_void {
        if count.checked_mul(elem_size).is_none() {
            return std::ptr::null_mut();
        }
        self.take()
    }

    unsafe fn resize(&mut self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let known = self.outstanding.contains(&(ptr as usize));
        if size == 0 && known {
            self.give_back(ptr as usize);
            return std::ptr::null_mut();
        }
        let fresh = self.take();
        if known {
            self.give_back(ptr as usize);
        }
        fresh
    }

    unsafe fn release(&mut self, ptr: *mut c_void) {
        self.give_back(ptr as usize);
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let config = TracerConfig {
        max_records: 256,
        ..TracerConfig::default()
    };
    let mut t = TracerState::attach(Synthetic::default(), NullSink, &config);
    let mut handed_out: Vec<*mut c_void> = Vec::new();

    for chunk in data.chunks_exact(4) {
        // Pass-through forwards everything, garbage included.
        if t.is_degraded() {
            break;
        }
        let op = chunk[0] % 5;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let pick = chunk[3] as usize;

        match op {
            0 => handed_out.push(t.allocate(size)),
            1 => handed_out.push(t.zero_allocate(size, pick)),
            2 => {
                if !handed_out.is_empty() {
                    let p = handed_out[pick % handed_out.len()];
                    handed_out.push(unsafe { t.resize(p, size) });
                }
            }
            3 => {
                if !handed_out.is_empty() {
                    let p = handed_out[pick % handed_out.len()];
                    unsafe { t.release(p) };
                }
            }
            _ => unsafe { t.release((size << 4 | 0x8) as *mut c_void) },
        }

        if !t.is_degraded() {
            assert_eq!(t.bytes().outstanding(), t.ledger().live_bytes());
        }
    }

    let (report, _) = t.finalize();
    if !report.degraded {
        assert_eq!(report.leaked_bytes(), report.statistics.live_bytes);
    }
});
