//! # memtrace-membrane
//!
//! The layer that sits between a traced program and its real allocator.
//!
//! ```text
//!   program --malloc/calloc/realloc/free--> TracerState --> RealAllocator
//!                                               |
//!                                  Ledger + counters (memtrace-core)
//!                                               |
//!                                          TraceEvent --> EventSink
//! ```
//!
//! Nothing here knows about symbol interposition; that lives in
//! `memtrace-abi`, which binds [`RealAllocator`] to the next allocator in
//! link order and keeps one [`TracerState`] for the whole process.

#![deny(unsafe_code)]

pub mod config;
pub mod event;
pub mod sink;
pub mod tracer;

pub use config::{LogFormat, LogTarget, TraceMode, TracerConfig};
pub use event::{Addr, EVENT_NAMES, Primitive, Severity, TraceEvent};
pub use sink::{EventSink, NullSink, RecordingSink, StreamSink, jsonl_line};
pub use tracer::{FinalReport, Mode, RealAllocator, TracerState};
