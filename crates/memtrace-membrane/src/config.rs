//! Runtime configuration.
//!
//! Everything is driven by environment variables read once at attach time:
//! - `MEMTRACE_MODE`: `trace` (default) records every call in the ledger;
//!   `off` forwards every call untouched.
//! - `MEMTRACE_FORMAT`: `text` (default) or `jsonl`.
//! - `MEMTRACE_LOG`: output path, or `stderr` / `-` (default).
//! - `MEMTRACE_MAX_RECORDS`: ledger record limit.
//! - `MEMTRACE_LOG_CALLS`: `0` keeps only anomalies and the final report.
//!
//! Parsing is loose: unknown values fall back to the defaults instead of
//! failing, since there is nobody to report a configuration error to from
//! inside a preloaded allocator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use memtrace_core::DEFAULT_MAX_RECORDS;
use serde::Serialize;

pub const ENV_MODE: &str = "MEMTRACE_MODE";
pub const ENV_FORMAT: &str = "MEMTRACE_FORMAT";
pub const ENV_LOG: &str = "MEMTRACE_LOG";
pub const ENV_MAX_RECORDS: &str = "MEMTRACE_MAX_RECORDS";
pub const ENV_LOG_CALLS: &str = "MEMTRACE_LOG_CALLS";

/// Whether the tracer keeps books or just forwards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceMode {
    /// Every call is recorded in the ledger and reported.
    #[default]
    Trace,
    /// Pure passthrough to the real allocator.
    Off,
}

impl TraceMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "passthrough" | "0" => Self::Off,
            _ => Self::Trace,
        }
    }

    #[must_use]
    pub const fn tracing_enabled(self) -> bool {
        matches!(self, Self::Trace)
    }
}

/// Output format of the event stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Jsonl,
}

impl LogFormat {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "json" | "ndjson" => Self::Jsonl,
            _ => Self::Text,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Jsonl => "jsonl",
        }
    }
}

/// Where events are written.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Stderr,
    File(PathBuf),
}

impl LogTarget {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim() {
            "" | "-" | "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

/// Complete tracer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerConfig {
    pub mode: TraceMode,
    pub format: LogFormat,
    pub target: LogTarget,
    pub max_records: usize,
    /// Emit one event per successful call. Anomalies and the final report
    /// are always emitted.
    pub log_calls: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            mode: TraceMode::default(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            max_records: DEFAULT_MAX_RECORDS,
            log_calls: true,
        }
    }
}

impl TracerConfig {
    /// Build a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            mode: lookup(ENV_MODE)
                .map(|v| TraceMode::from_str_loose(&v))
                .unwrap_or(defaults.mode),
            format: lookup(ENV_FORMAT)
                .map(|v| LogFormat::from_str_loose(&v))
                .unwrap_or(defaults.format),
            target: lookup(ENV_LOG)
                .map(|v| LogTarget::from_str_loose(&v))
                .unwrap_or(defaults.target),
            max_records: lookup(ENV_MAX_RECORDS)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_records),
            log_calls: lookup(ENV_LOG_CALLS)
                .map(|v| parse_flag(&v, defaults.log_calls))
                .unwrap_or(defaults.log_calls),
        }
    }

    /// Read the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse_flag(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

// Atomic cache: 0=unresolved, 1=Trace, 2=Off, 255=resolving.
// Never blocks: the environment lookup can allocate and re-enter.
static CACHED_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_TRACE: u8 = 1;
const MODE_OFF: u8 = 2;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: TraceMode) -> u8 {
    match mode {
        TraceMode::Trace => MODE_TRACE,
        TraceMode::Off => MODE_OFF,
    }
}

fn u8_to_mode(v: u8) -> TraceMode {
    match v {
        MODE_OFF => TraceMode::Off,
        _ => TraceMode::Trace,
    }
}

/// Process-wide trace mode (reads `MEMTRACE_MODE` on first call, caches
/// thereafter).
///
/// A call arriving while another is resolving sees `Off`, so nested
/// allocations during the environment lookup are forwarded untouched.
#[must_use]
pub fn trace_mode() -> TraceMode {
    let cached = CACHED_MODE.load(Ordering::Acquire);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING {
        return TraceMode::Off;
    }

    if CACHED_MODE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_MODE.load(Ordering::Acquire);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            TraceMode::Off
        };
    }

    let mode = std::env::var(ENV_MODE)
        .map(|v| TraceMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}

/// Pin the process-wide mode, e.g. after the tracer had to give up.
pub fn force_trace_mode(mode: TraceMode) {
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
}
