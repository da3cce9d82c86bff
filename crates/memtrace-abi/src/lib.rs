// All extern "C" ABI exports accept raw pointers from C callers; the tracer
// checks every release against its ledger, so per-function safety docs would
// repeat the POSIX contract.
#![allow(clippy::missing_safety_doc)]
//! # memtrace-abi
//!
//! Preloadable heap tracer. Built as a `cdylib` (`libmemtrace.so`) and
//! injected with `LD_PRELOAD`, it exports `malloc`, `calloc`, `realloc` and
//! `free`, records every block in an allocation ledger, reports invalid and
//! double frees as they happen, and prints statistics and a leak report when
//! the process exits.
//!
//! # Architecture
//!
//! ```text
//! C caller -> ABI entry (this crate) -> TracerState (memtrace-membrane)
//!                  |                          |
//!                  |                   Ledger (memtrace-core)
//!                  v                          v
//!          next malloc in link order <- RealAllocator (dlsym RTLD_NEXT)
//! ```
//!
//! Symbols are exported from release builds only; debug and test builds
//! keep the Rust functions without interposing the host allocator, since
//! `#[no_mangle]` allocator symbols would shadow the system allocator in the
//! test binary.

pub mod lifecycle;
pub mod malloc_abi;
pub mod real_alloc;
pub mod untracked;

#[cfg(not(any(test, debug_assertions)))]
mod global_alloc;

pub use lifecycle::{attach_from_env, attach_with, detach, is_attached, with_tracer};
pub use real_alloc::NextAllocator;
