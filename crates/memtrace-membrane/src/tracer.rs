//! The interception layer proper.
//!
//! [`TracerState`] wraps a [`RealAllocator`] and keeps the ledger and the
//! running counters in step with every call it forwards. It owns no global
//! state: the preload shim keeps exactly one instance behind a lock, tests
//! build as many as they like around a fake allocator.
//!
//! Call flow:
//! ```text
//!   allocate / zero_allocate / resize / release
//!        |
//!        +-- Mode::PassThrough --> real allocator, nothing recorded
//!        |
//!        +-- Mode::Tracing ------> real allocator first (except rejected
//!                                  releases), then ledger + counters,
//!                                  then one event to the sink
//! ```

#![allow(unsafe_code)]

use std::ffi::c_void;

use memtrace_core::{AllocationRecord, ByteCounters, CallCounters, Ledger, LedgerError, Statistics};
use serde::Serialize;

use crate::config::TracerConfig;
use crate::event::{Addr, Primitive, TraceEvent};
use crate::sink::EventSink;

/// The allocator being wrapped.
///
/// In the preload shim this is the next `malloc` family in link order; in
/// tests it is a fake that hands out synthetic addresses.
pub trait RealAllocator {
    fn allocate(&mut self, size: usize) -> *mut c_void;

    fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from this allocator.
    unsafe fn resize(&mut self, ptr: *mut c_void, size: usize) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` must be null or a live block obtained from this allocator.
    unsafe fn release(&mut self, ptr: *mut c_void);
}

/// Whether calls are being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Tracing,
    /// Forward everything. Selected by configuration or entered after the
    /// ledger ran out of room.
    PassThrough,
}

/// What the tracer knew at detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalReport {
    pub statistics: Statistics,
    /// Live records at detach, in ledger order. Empty when degraded.
    pub leaks: Vec<AllocationRecord>,
    pub calls: CallCounters,
    pub bytes: ByteCounters,
    /// Tracing stopped early because the ledger was exhausted.
    pub degraded: bool,
}

impl FinalReport {
    #[must_use]
    pub fn leaked_bytes(&self) -> u64 {
        self.leaks.iter().map(|r| r.size as u64).sum()
    }
}

/// Ledger, counters and sink for one traced process (or one test).
pub struct TracerState<A: RealAllocator, S: EventSink> {
    real: A,
    sink: S,
    ledger: Ledger,
    calls: CallCounters,
    bytes: ByteCounters,
    mode: Mode,
    degraded: bool,
    log_calls: bool,
}

impl<A: RealAllocator, S: EventSink> TracerState<A, S> {
    /// Build a tracer and announce it on `sink`.
    pub fn attach(real: A, sink: S, config: &TracerConfig) -> Self {
        let mode = if config.mode.tracing_enabled() {
            Mode::Tracing
        } else {
            Mode::PassThrough
        };
        let mut state = Self {
            real,
            sink,
            ledger: Ledger::with_capacity_limit(config.max_records),
            calls: CallCounters::default(),
            bytes: ByteCounters::default(),
            mode,
            degraded: false,
            log_calls: config.log_calls,
        };
        state.emit(TraceEvent::Attach { mode: config.mode });
        state
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn calls(&self) -> &CallCounters {
        &self.calls
    }

    #[must_use]
    pub fn bytes(&self) -> &ByteCounters {
        &self.bytes
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    #[must_use]
    pub fn real(&self) -> &A {
        &self.real
    }

    pub fn real_mut(&mut self) -> &mut A {
        &mut self.real
    }

    /// Current statistics, without detaching.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        Statistics::compute(&self.calls, &self.bytes, &self.ledger)
    }

    // ---- malloc ----

    pub fn allocate(&mut self, size: usize) -> *mut c_void {
        let ptr = self.real.allocate(size);
        if self.mode == Mode::PassThrough {
            return ptr;
        }
        if ptr.is_null() {
            self.allocation_failed(Primitive::Malloc, size);
            return ptr;
        }
        if self.record(ptr as usize, size) {
            self.calls.allocate += 1;
            self.bytes.add_allocated(size);
            self.emit(TraceEvent::Allocate {
                size,
                address: Addr(ptr as usize),
            });
        }
        ptr
    }

    // ---- calloc ----

    pub fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut c_void {
        let ptr = self.real.zero_allocate(count, elem_size);
        if self.mode == Mode::PassThrough {
            return ptr;
        }
        let Some(size) = count.checked_mul(elem_size) else {
            // The real calloc rejects the overflow itself; anything it hands
            // back anyway cannot be sized, so it stays untracked.
            self.allocation_failed(Primitive::Calloc, usize::MAX);
            return ptr;
        };
        if ptr.is_null() {
            self.allocation_failed(Primitive::Calloc, size);
            return ptr;
        }
        if self.record(ptr as usize, size) {
            self.calls.zero_allocate += 1;
            self.bytes.add_allocated(size);
            self.emit(TraceEvent::ZeroAllocate {
                count,
                elem_size,
                address: Addr(ptr as usize),
            });
        }
        ptr
    }

    // ---- realloc ----

    /// Resize `ptr` to `size` bytes.
    ///
    /// The real primitive is always called first. On success the old block
    /// is released in the ledger (reporting it if it was unknown or already
    /// released) and the returned block is recorded with `size`. A null
    /// result with `size > 0` is a failure and leaves the old block live; a
    /// null result with `size == 0` means the real allocator freed `ptr`.
    ///
    /// # Safety
    ///
    /// Same contract as [`RealAllocator::resize`].
    pub unsafe fn resize(&mut self, ptr: *mut c_void, size: usize) -> *mut c_void {
        // SAFETY: forwarded caller contract.
        let new_ptr = unsafe { self.real.resize(ptr, size) };
        if self.mode == Mode::PassThrough {
            return new_ptr;
        }
        let old = ptr as usize;

        if new_ptr.is_null() {
            if size == 0 && old != 0 {
                self.resize_freed(old);
            } else {
                self.allocation_failed(Primitive::Realloc, size);
            }
            return new_ptr;
        }

        if old != 0 {
            self.release_for_resize(old, size);
        }
        if self.record(new_ptr as usize, size) {
            self.calls.resize += 1;
            self.bytes.add_allocated(size);
            self.emit(TraceEvent::Resize {
                old_address: Addr(old),
                size,
                address: Addr(new_ptr as usize),
            });
        }
        new_ptr
    }

    // ---- free ----

    /// Release `ptr`.
    ///
    /// Addresses the ledger has never seen and addresses already released
    /// are reported and not forwarded. Null is ignored without a ledger
    /// lookup.
    ///
    /// # Safety
    ///
    /// Same contract as [`RealAllocator::release`], except that pointers this
    /// tracer rejects are never dereferenced or forwarded.
    pub unsafe fn release(&mut self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        if self.mode == Mode::PassThrough {
            // SAFETY: forwarded caller contract.
            unsafe { self.real.release(ptr) };
            return;
        }

        let address = ptr as usize;
        match self.ledger.find(address).copied() {
            None => {
                self.calls.invalid_releases += 1;
                self.emit(TraceEvent::InvalidFree {
                    address: Addr(address),
                });
            }
            Some(record) if !record.is_live() => {
                self.calls.double_releases += 1;
                self.emit(TraceEvent::DoubleFree {
                    address: Addr(address),
                    size: record.size,
                });
            }
            Some(_) => {
                // SAFETY: the ledger holds this address as a live block
                // handed out by `self.real`.
                unsafe { self.real.release(ptr) };
                if let Some(before) = self.ledger.record_release(address) {
                    self.calls.release += 1;
                    self.bytes.add_freed(before.size);
                    self.emit(TraceEvent::Release {
                        address: Addr(address),
                        size: before.size,
                    });
                }
            }
        }
    }

    /// Detach: report statistics and leaks, then drop the ledger.
    ///
    /// Returns the report together with the sink so callers can inspect or
    /// flush what was written.
    pub fn finalize(mut self) -> (FinalReport, S) {
        let statistics = self.statistics();
        self.emit(TraceEvent::Statistics(statistics));

        let leaks: Vec<AllocationRecord> = if self.degraded {
            Vec::new()
        } else {
            self.ledger.live_records().copied().collect()
        };
        if !leaks.is_empty() {
            let bytes = leaks.iter().map(|r| r.size as u64).sum();
            self.emit(TraceEvent::LeakReportStart {
                blocks: leaks.len(),
                bytes,
            });
            for record in &leaks {
                self.emit(TraceEvent::Leak {
                    address: Addr(record.address),
                    size: record.size,
                    live_count: record.live_count,
                });
            }
        }
        self.emit(TraceEvent::Detach);
        self.sink.flush();

        let Self {
            sink,
            ledger,
            calls,
            bytes,
            degraded,
            ..
        } = self;
        ledger.destroy();
        (
            FinalReport {
                statistics,
                leaks,
                calls,
                bytes,
                degraded,
            },
            sink,
        )
    }

    fn emit(&mut self, event: TraceEvent) {
        if !self.log_calls && event.is_call_record() {
            return;
        }
        self.sink.emit(&event);
    }

    fn allocation_failed(&mut self, primitive: Primitive, size: usize) {
        self.calls.failed += 1;
        self.emit(TraceEvent::AllocationFailed { primitive, size });
    }

    /// Record a fresh block. Returns false when the ledger is exhausted, in
    /// which case the tracer has switched to pass-through.
    fn record(&mut self, address: usize, size: usize) -> bool {
        // A live record for a freshly returned address means the block was
        // freed behind our back (an untraced path); retire the old size.
        let stale = self
            .ledger
            .find(address)
            .filter(|r| r.is_live())
            .map(|r| r.size);
        match self.ledger.record_allocation(address, size) {
            Ok(_) => {
                if let Some(stale) = stale {
                    self.bytes.add_freed(stale);
                }
                true
            }
            Err(err @ LedgerError::Exhausted { .. }) => {
                self.degrade(&err);
                false
            }
            // Callers never pass null.
            Err(LedgerError::NullAddress) => false,
        }
    }

    fn degrade(&mut self, err: &LedgerError) {
        self.mode = Mode::PassThrough;
        if !self.degraded {
            self.degraded = true;
            self.emit(TraceEvent::TracerDegraded {
                reason: err.to_string(),
            });
        }
    }

    /// Old-block half of a successful resize.
    fn release_for_resize(&mut self, old: usize, size: usize) {
        match self.ledger.find(old).copied() {
            None => {
                self.calls.unknown_resizes += 1;
                self.emit(TraceEvent::ResizeOfUnknown {
                    old_address: Addr(old),
                    size,
                });
            }
            Some(record) if !record.is_live() => {
                self.calls.unknown_resizes += 1;
                self.emit(TraceEvent::ResizeOfReleased {
                    old_address: Addr(old),
                    size,
                });
            }
            Some(_) => {
                if let Some(before) = self.ledger.record_release(old) {
                    self.bytes.add_freed(before.size);
                }
            }
        }
    }

    /// `realloc(p, 0)` returned null: the real allocator freed `p`.
    fn resize_freed(&mut self, old: usize) {
        match self.ledger.find(old).copied() {
            None => {
                self.calls.unknown_resizes += 1;
                self.emit(TraceEvent::ResizeOfUnknown {
                    old_address: Addr(old),
                    size: 0,
                });
            }
            Some(record) if !record.is_live() => {
                self.calls.unknown_resizes += 1;
                self.emit(TraceEvent::ResizeOfReleased {
                    old_address: Addr(old),
                    size: 0,
                });
            }
            Some(_) => {
                if let Some(before) = self.ledger.record_release(old) {
                    self.calls.release += 1;
                    self.bytes.add_freed(before.size);
                    self.emit(TraceEvent::Release {
                        address: Addr(old),
                        size: before.size,
                    });
                }
            }
        }
    }
}
