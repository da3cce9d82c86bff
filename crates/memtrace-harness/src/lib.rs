//! Tooling around the memtrace heap tracer.
//!
//! This crate provides:
//! - Launcher: run a program with `libmemtrace.so` preloaded and the
//!   `MEMTRACE_*` environment set
//! - Trace validation: check a JSONL trace line by line against the event
//!   contract
//! - Summaries: replay a JSONL trace, cross-check the tracer's own
//!   statistics, list leaks and anomalies, fingerprint the file

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod summary;
pub mod trace_log;

pub use error::HarnessError;
pub use runner::RunOptions;
pub use summary::TraceSummary;
pub use trace_log::TraceValidationError;
