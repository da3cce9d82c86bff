//! Attach/detach of the process-wide tracer.
//!
//! One [`TracerState`] lives behind a `parking_lot::Mutex` for the whole
//! process. It is attached by the `.init_array` constructor, or lazily by the
//! first intercepted call if that comes earlier, and finalized by the
//! `.fini_array` destructor. Before attach completes on another thread,
//! callers spin; after detach, every call goes straight to the real
//! allocator.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::LineWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use memtrace_membrane::config::{self, LogTarget, TraceMode, TracerConfig};
use memtrace_membrane::{EventSink, FinalReport, StreamSink, TracerState};
use parking_lot::Mutex;

use crate::real_alloc::{self, NextAllocator};

pub type BoxedSink = Box<dyn EventSink + Send>;
pub type ProcessTracer = TracerState<NextAllocator, BoxedSink>;

static TRACER: Mutex<Option<ProcessTracer>> = Mutex::new(None);

const UNATTACHED: u8 = 0;
const ATTACHING: u8 = 1;
const ATTACHED: u8 = 2;
const DETACHED: u8 = 3;

static ATTACH_STATE: AtomicU8 = AtomicU8::new(UNATTACHED);

// ---------------------------------------------------------------------------
// reentry guard
// ---------------------------------------------------------------------------

thread_local! {
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Held while a thread is inside the tracer. A second entry on the same
/// thread (an allocation made by the tracer itself or by `dlsym`) must
/// bypass the tracer.
pub struct AllocatorReentryGuard;

impl Drop for AllocatorReentryGuard {
    fn drop(&mut self) {
        let _ = ALLOCATOR_REENTRY_DEPTH.try_with(|depth| {
            depth.set(depth.get().saturating_sub(1));
        });
    }
}

/// `None` when this thread is already inside the tracer, or its
/// thread-locals are gone.
#[inline]
pub fn enter_allocator_reentry_guard() -> Option<AllocatorReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH
        .try_with(|depth| {
            let current = depth.get();
            if current > 0 {
                None
            } else {
                depth.set(current + 1);
                Some(AllocatorReentryGuard)
            }
        })
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// attach / detach
// ---------------------------------------------------------------------------

/// Replace every `%p` in a log path with `pid`.
#[must_use]
pub fn expand_log_path(path: &Path, pid: u32) -> PathBuf {
    match path.to_str() {
        Some(s) if s.contains("%p") => PathBuf::from(s.replace("%p", &pid.to_string())),
        _ => path.to_path_buf(),
    }
}

/// Open the configured destination.
///
/// `MEMTRACE_LOG` is inherited by every process the traced program starts,
/// so files are opened for append and written one event per `write`. Each
/// record carries the process id.
fn open_sink(config: &TracerConfig) -> BoxedSink {
    let pid = std::process::id();
    if let LogTarget::File(path) = &config.target {
        let path = expand_log_path(path, pid);
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) {
            return Box::new(StreamSink::new(LineWriter::new(file), config.format).with_pid(pid));
        }
    }
    Box::new(StreamSink::new(std::io::stderr(), config.format).with_pid(pid))
}

/// Attach using the process environment. Returns whether a tracer is live.
pub fn attach_from_env() -> bool {
    real_alloc::resolve_real_functions();
    if !begin_attach() {
        return is_attached();
    }
    let config = TracerConfig::from_env();
    let sink = open_sink(&config);
    install(&config, sink)
}

/// Attach with an explicit configuration and sink.
///
/// Returns false if a tracer was already attached or detached.
pub fn attach_with(config: &TracerConfig, sink: BoxedSink) -> bool {
    if !begin_attach() {
        return false;
    }
    install(config, sink)
}

fn begin_attach() -> bool {
    ATTACH_STATE
        .compare_exchange(UNATTACHED, ATTACHING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

fn finish_disabled() -> bool {
    ATTACH_STATE.store(DETACHED, Ordering::Release);
    false
}

fn install(config: &TracerConfig, sink: BoxedSink) -> bool {
    if !config.mode.tracing_enabled() {
        return finish_disabled();
    }
    let tracer = TracerState::attach(NextAllocator, sink, config);
    *TRACER.lock() = Some(tracer);
    register_fork_handler();
    ATTACH_STATE.store(ATTACHED, Ordering::Release);
    true
}

/// Child side of `fork`: the ledger and log position belong to the parent,
/// so the child stops tracing. A child that execs attaches afresh.
unsafe extern "C" fn after_fork_in_child() {
    ATTACH_STATE.store(DETACHED, Ordering::Release);
    config::force_trace_mode(TraceMode::Off);
}

fn register_fork_handler() {
    static REGISTERED: AtomicBool = AtomicBool::new(false);
    if !REGISTERED.swap(true, Ordering::AcqRel) {
        // SAFETY: registers a plain C callback that only touches atomics.
        unsafe {
            libc::pthread_atfork(None, None, Some(after_fork_in_child));
        }
    }
}

#[must_use]
pub fn is_attached() -> bool {
    ATTACH_STATE.load(Ordering::Acquire) == ATTACHED
}

/// Make sure attach has happened one way or the other. Returns whether a
/// tracer is live.
pub fn ensure_attached() -> bool {
    loop {
        match ATTACH_STATE.load(Ordering::Acquire) {
            ATTACHED => return true,
            DETACHED => return false,
            UNATTACHED => return attach_from_env(),
            _ => std::hint::spin_loop(),
        }
    }
}

/// Finalize the tracer: statistics and leak report go to its sink, the
/// ledger is dropped, and every later call is forwarded untouched.
pub fn detach() -> Option<FinalReport> {
    let previous = ATTACH_STATE.swap(DETACHED, Ordering::AcqRel);
    if previous != ATTACHED {
        return None;
    }
    let tracer = TRACER.lock().take()?;
    let (report, _sink) = tracer.finalize();
    Some(report)
}

/// Run `f` against the live tracer.
///
/// Returns `None` when no tracer is live, in which case the caller forwards
/// to the real allocator itself.
pub fn with_tracer<R>(f: impl FnOnce(&mut ProcessTracer) -> R) -> Option<R> {
    if config::trace_mode() == TraceMode::Off || !ensure_attached() {
        return None;
    }
    let mut guard = TRACER.lock();
    let tracer = guard.as_mut()?;
    let out = f(tracer);
    if tracer.is_degraded() {
        // Skip the lock entirely from now on.
        config::force_trace_mode(TraceMode::Off);
    }
    Some(out)
}

// Constructor/destructor, only when the interposing symbols are exported.
#[cfg(all(target_os = "linux", not(test), not(debug_assertions)))]
#[used]
#[unsafe(link_section = ".init_array")]
static MEMTRACE_CTOR: extern "C" fn() = {
    extern "C" fn memtrace_init() {
        if let Some(_guard) = enter_allocator_reentry_guard() {
            ensure_attached();
        }
    }
    memtrace_init
};

#[cfg(all(target_os = "linux", not(test), not(debug_assertions)))]
#[used]
#[unsafe(link_section = ".fini_array")]
static MEMTRACE_DTOR: extern "C" fn() = {
    extern "C" fn memtrace_fini() {
        if let Some(_guard) = enter_allocator_reentry_guard() {
            let _ = detach();
        }
    }
    memtrace_fini
};
