//! Running counters kept by the interception layer and the statistics
//! derived from them when the tracer detaches.

use serde::Serialize;

use crate::ledger::Ledger;

/// Per-primitive call tallies.
///
/// `allocate`, `zero_allocate` and `resize` count successful calls only;
/// calls the real allocator failed land in `failed` instead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub allocate: u64,
    pub zero_allocate: u64,
    pub resize: u64,
    /// Releases forwarded to the real allocator.
    pub release: u64,
    /// Allocating calls for which the real allocator returned null.
    pub failed: u64,
    /// Releases of addresses never handed out.
    pub invalid_releases: u64,
    /// Releases of addresses already released.
    pub double_releases: u64,
    /// Resizes whose old address was unknown or already released.
    pub unknown_resizes: u64,
}

impl CallCounters {
    /// Successful calls across the three allocating primitives.
    #[must_use]
    pub const fn allocating_calls(&self) -> u64 {
        self.allocate
            .saturating_add(self.zero_allocate)
            .saturating_add(self.resize)
    }

    /// Releases that were reported and not forwarded.
    #[must_use]
    pub const fn rejected_releases(&self) -> u64 {
        self.invalid_releases.saturating_add(self.double_releases)
    }
}

/// Cumulative byte totals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteCounters {
    pub allocated: u64,
    pub freed: u64,
}

impl ByteCounters {
    pub fn add_allocated(&mut self, size: usize) {
        self.allocated = self.allocated.saturating_add(size as u64);
    }

    pub fn add_freed(&mut self, size: usize) {
        self.freed = self.freed.saturating_add(size as u64);
    }

    /// Bytes allocated and not yet freed, as the counters see it.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

/// Final figures reported at detach.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    /// `bytes_allocated / allocating_calls`, 0 when nothing was allocated.
    pub average_allocation: u64,
    pub allocating_calls: u64,
    /// Bytes still held by live ledger records.
    pub live_bytes: u64,
    pub live_blocks: u64,
}

impl Statistics {
    #[must_use]
    pub fn compute(calls: &CallCounters, bytes: &ByteCounters, ledger: &Ledger) -> Self {
        let allocating_calls = calls.allocating_calls();
        let average_allocation = bytes
            .allocated
            .checked_div(allocating_calls)
            .unwrap_or(0);
        Self {
            bytes_allocated: bytes.allocated,
            bytes_freed: bytes.freed,
            average_allocation,
            allocating_calls,
            live_bytes: ledger.live_bytes(),
            live_blocks: ledger.live_blocks() as u64,
        }
    }
}
