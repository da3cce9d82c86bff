//! Safe core of the memtrace heap tracer.
//!
//! This crate holds the pure bookkeeping pieces:
//! - [`ledger`]: the registry of every address ever handed out by the traced
//!   allocator, with live/released state per address.
//! - [`accounting`]: running call and byte counters plus the statistics
//!   derived from them at detach time.
//!
//! Nothing here performs I/O or touches raw memory.

#![deny(unsafe_code)]

pub mod accounting;
pub mod ledger;

pub use accounting::{ByteCounters, CallCounters, Statistics};
pub use ledger::{AllocationRecord, DEFAULT_MAX_RECORDS, Ledger, LedgerError, RecordHandle};
