//! Allocation ledger: ownership registry for every address the traced
//! allocator has ever returned.
//!
//! Records live in an arena (`Vec<AllocationRecord>`) addressed by a stable
//! [`RecordHandle`]; an address index maps raw addresses to handles. Records
//! are never removed. Releasing an address only drops its `live_count` to 0,
//! which is what makes double and stale releases detectable later on.
//!
//! Allocators recycle freed blocks constantly, so re-recording an address that
//! already has a (released) record is the normal path: the existing record is
//! revived in place instead of a duplicate being created.
//!
//! Growth goes through `try_reserve` so that a failure to extend the ledger's
//! own storage surfaces as [`LedgerError::Exhausted`] instead of aborting the
//! host process.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Default upper bound on the number of distinct addresses tracked.
pub const DEFAULT_MAX_RECORDS: usize = 1 << 20;

/// Stable index of a record inside the ledger arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordHandle(u32);

impl RecordHandle {
    /// Position of the record in insertion order.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One entry per address ever handed to the traced program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// Address returned by the real allocator. Identity key of the record.
    pub address: usize,
    /// Last known size in bytes. Kept after release so stale lookups can
    /// still report what the block used to be.
    pub size: usize,
    /// 1 while the block is live, 0 once released.
    pub live_count: u32,
}

impl AllocationRecord {
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live_count > 0
    }
}

/// Failures of the ledger's own bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A null address can never be a tracked allocation.
    #[error("refusing to record a null address")]
    NullAddress,
    /// Backing storage for records cannot grow any further.
    #[error("ledger exhausted after {records} records (limit {limit})")]
    Exhausted { records: usize, limit: usize },
}

/// Registry of allocation records keyed by address.
#[derive(Debug)]
pub struct Ledger {
    records: Vec<AllocationRecord>,
    /// Map from address to arena index.
    addr_to_record: HashMap<usize, RecordHandle>,
    max_records: usize,
}

impl Ledger {
    /// Create an empty ledger with the default record limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_limit(DEFAULT_MAX_RECORDS)
    }

    /// Create an empty ledger that refuses to track more than `max_records`
    /// distinct addresses. The limit is clamped to what a [`RecordHandle`]
    /// can index.
    #[must_use]
    pub fn with_capacity_limit(max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            addr_to_record: HashMap::new(),
            max_records: max_records.min(u32::MAX as usize),
        }
    }

    #[must_use]
    pub fn capacity_limit(&self) -> usize {
        self.max_records
    }

    /// Number of distinct addresses ever recorded (live or released).
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record `address` as live with `size` bytes.
    ///
    /// If the address already has a record (the real allocator reused a
    /// released block), that record is overwritten in place and revived.
    pub fn record_allocation(
        &mut self,
        address: usize,
        size: usize,
    ) -> Result<RecordHandle, LedgerError> {
        if address == 0 {
            return Err(LedgerError::NullAddress);
        }

        if let Some(&handle) = self.addr_to_record.get(&address) {
            let record = &mut self.records[handle.index()];
            record.size = size;
            record.live_count = 1;
            return Ok(handle);
        }

        let exhausted = LedgerError::Exhausted {
            records: self.records.len(),
            limit: self.max_records,
        };
        if self.records.len() >= self.max_records {
            return Err(exhausted);
        }
        let handle = u32::try_from(self.records.len())
            .map(RecordHandle)
            .map_err(|_| exhausted)?;
        self.records.try_reserve(1).map_err(|_| exhausted)?;
        self.addr_to_record.try_reserve(1).map_err(|_| exhausted)?;

        self.records.push(AllocationRecord {
            address,
            size,
            live_count: 1,
        });
        self.addr_to_record.insert(address, handle);
        Ok(handle)
    }

    /// Look up the record for `address`.
    #[must_use]
    pub fn find(&self, address: usize) -> Option<&AllocationRecord> {
        let handle = self.addr_to_record.get(&address)?;
        self.records.get(handle.index())
    }

    #[must_use]
    pub fn handle_of(&self, address: usize) -> Option<RecordHandle> {
        self.addr_to_record.get(&address).copied()
    }

    #[must_use]
    pub fn get(&self, handle: RecordHandle) -> Option<&AllocationRecord> {
        self.records.get(handle.index())
    }

    /// Mark `address` as released and return the record as it was just
    /// before the release, so the caller can read the freed size.
    ///
    /// Liveness is the caller's business: releasing an already released
    /// record returns its snapshot (with `live_count == 0`) and leaves it
    /// untouched. Returns `None` when the address was never recorded.
    pub fn record_release(&mut self, address: usize) -> Option<AllocationRecord> {
        let handle = *self.addr_to_record.get(&address)?;
        let record = &mut self.records[handle.index()];
        let before = *record;
        record.live_count = record.live_count.saturating_sub(1);
        Some(before)
    }

    /// Visit every record exactly once, in insertion order.
    pub fn for_each(&self, mut visit: impl FnMut(&AllocationRecord)) {
        for record in &self.records {
            visit(record);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter()
    }

    /// Records still live, in insertion order.
    pub fn live_records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.iter().filter(|r| r.is_live())
    }

    /// Sum of `size` over live records.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_records()
            .fold(0u64, |acc, r| acc.saturating_add(r.size as u64))
    }

    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.live_records().count()
    }

    /// Release all backing storage.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
