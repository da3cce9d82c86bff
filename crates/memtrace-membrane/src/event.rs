//! Typed events emitted by the interception layer.
//!
//! The tracer never formats anything itself; it hands these values to an
//! [`EventSink`](crate::sink::EventSink), which decides on layout and
//! destination.

use std::fmt;

use memtrace_core::Statistics;
use serde::{Serialize, Serializer};

use crate::config::TraceMode;

/// A raw address, rendered as `0x`-prefixed hex in every output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub usize);

impl Addr {
    #[must_use]
    pub fn of<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            f.write_str("(nil)")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("{:#x}", self.0))
    }
}

/// The four intercepted primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

impl Primitive {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Realloc => "realloc",
            Self::Free => "free",
        }
    }
}

/// How loudly an event should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Everything the tracer can report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Attach {
        mode: TraceMode,
    },
    Detach,
    Allocate {
        size: usize,
        address: Addr,
    },
    ZeroAllocate {
        count: usize,
        elem_size: usize,
        address: Addr,
    },
    Resize {
        old_address: Addr,
        size: usize,
        address: Addr,
    },
    Release {
        address: Addr,
        size: usize,
    },
    /// The real allocator returned null; nothing was recorded.
    AllocationFailed {
        primitive: Primitive,
        size: usize,
    },
    /// Release of an address this tracer never handed out. Not forwarded.
    InvalidFree {
        address: Addr,
    },
    /// Release of an address that is already released. Not forwarded.
    DoubleFree {
        address: Addr,
        size: usize,
    },
    /// Resize of an address this tracer never handed out.
    ResizeOfUnknown {
        old_address: Addr,
        size: usize,
    },
    /// Resize of an address that was already released.
    ResizeOfReleased {
        old_address: Addr,
        size: usize,
    },
    /// The ledger could not grow; the tracer is forwarding from now on.
    TracerDegraded {
        reason: String,
    },
    LeakReportStart {
        blocks: usize,
        bytes: u64,
    },
    Leak {
        address: Addr,
        size: usize,
        live_count: u32,
    },
    Statistics(Statistics),
}

/// Every event name that can appear in a serialized trace.
pub const EVENT_NAMES: &[&str] = &[
    "attach",
    "detach",
    "allocate",
    "zero_allocate",
    "resize",
    "release",
    "allocation_failed",
    "invalid_free",
    "double_free",
    "resize_of_unknown",
    "resize_of_released",
    "tracer_degraded",
    "leak_report_start",
    "leak",
    "statistics",
];

impl TraceEvent {
    /// Stable name, identical to the serialized `event` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Detach => "detach",
            Self::Allocate { .. } => "allocate",
            Self::ZeroAllocate { .. } => "zero_allocate",
            Self::Resize { .. } => "resize",
            Self::Release { .. } => "release",
            Self::AllocationFailed { .. } => "allocation_failed",
            Self::InvalidFree { .. } => "invalid_free",
            Self::DoubleFree { .. } => "double_free",
            Self::ResizeOfUnknown { .. } => "resize_of_unknown",
            Self::ResizeOfReleased { .. } => "resize_of_released",
            Self::TracerDegraded { .. } => "tracer_degraded",
            Self::LeakReportStart { .. } => "leak_report_start",
            Self::Leak { .. } => "leak",
            Self::Statistics(_) => "statistics",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::InvalidFree { .. } | Self::DoubleFree { .. } | Self::TracerDegraded { .. } => {
                Severity::Error
            }
            Self::ResizeOfUnknown { .. }
            | Self::ResizeOfReleased { .. }
            | Self::AllocationFailed { .. }
            | Self::LeakReportStart { .. }
            | Self::Leak { .. } => Severity::Warn,
            _ => Severity::Info,
        }
    }

    /// Events describing one successful, ordinary call. These are the ones
    /// `MEMTRACE_LOG_CALLS=0` suppresses.
    #[must_use]
    pub const fn is_call_record(&self) -> bool {
        matches!(
            self,
            Self::Allocate { .. }
                | Self::ZeroAllocate { .. }
                | Self::Resize { .. }
                | Self::Release { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_renders_as_hex() {
        assert_eq!(Addr(0x1000).to_string(), "0x1000");
        assert_eq!(Addr(0).to_string(), "(nil)");
        assert_eq!(
            serde_json::to_value(Addr(255)).expect("serialize"),
            serde_json::json!("0xff")
        );
    }

    #[test]
    fn serialized_tag_matches_name() {
        let events = [
            TraceEvent::Attach {
                mode: TraceMode::Trace,
            },
            TraceEvent::Detach,
            TraceEvent::Allocate {
                size: 1,
                address: Addr(1),
            },
            TraceEvent::ZeroAllocate {
                count: 1,
                elem_size: 1,
                address: Addr(1),
            },
            TraceEvent::Resize {
                old_address: Addr(1),
                size: 1,
                address: Addr(2),
            },
            TraceEvent::Release {
                address: Addr(1),
                size: 1,
            },
            TraceEvent::AllocationFailed {
                primitive: Primitive::Calloc,
                size: 8,
            },
            TraceEvent::InvalidFree { address: Addr(1) },
            TraceEvent::DoubleFree {
                address: Addr(1),
                size: 1,
            },
            TraceEvent::ResizeOfUnknown {
                old_address: Addr(1),
                size: 1,
            },
            TraceEvent::ResizeOfReleased {
                old_address: Addr(1),
                size: 1,
            },
            TraceEvent::TracerDegraded {
                reason: "full".to_string(),
            },
            TraceEvent::LeakReportStart {
                blocks: 1,
                bytes: 1,
            },
            TraceEvent::Leak {
                address: Addr(1),
                size: 1,
                live_count: 1,
            },
            TraceEvent::Statistics(Statistics::default()),
        ];
        assert_eq!(events.len(), EVENT_NAMES.len());
        for (event, expected) in events.iter().zip(EVENT_NAMES) {
            let value = serde_json::to_value(event).expect("serialize");
            assert_eq!(value["event"], *expected);
            assert_eq!(event.name(), *expected);
        }
    }

    #[test]
    fn anomalies_are_louder_than_calls() {
        assert_eq!(
            TraceEvent::InvalidFree { address: Addr(8) }.severity(),
            Severity::Error
        );
        assert_eq!(
            TraceEvent::ResizeOfUnknown {
                old_address: Addr(8),
                size: 4
            }
            .severity(),
            Severity::Warn
        );
        assert_eq!(
            TraceEvent::Allocate {
                size: 4,
                address: Addr(8)
            }
            .severity(),
            Severity::Info
        );
    }

    #[test]
    fn statistics_fields_are_inlined() {
        let stats = Statistics {
            bytes_allocated: 96,
            bytes_freed: 64,
            average_allocation: 48,
            allocating_calls: 2,
            live_bytes: 32,
            live_blocks: 1,
        };
        let value = serde_json::to_value(TraceEvent::Statistics(stats)).expect("serialize");
        assert_eq!(value["event"], "statistics");
        assert_eq!(value["bytes_allocated"], 96);
        assert_eq!(value["average_allocation"], 48);
    }
}
