//! Replay a JSONL trace into a summary.
//!
//! Totals are recomputed from the per-call events and compared with the
//! `statistics` record the tracer wrote at detach. A trace recorded with
//! `MEMTRACE_LOG_CALLS=0` has no per-call events, so only the reported
//! figures are available for it.
//!
//! Records from several processes may share one file. Live blocks are keyed
//! by `(pid, address)` and the reported figures are summed across processes.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Digest;

use crate::error::HarnessError;
use crate::trace_log::validate_trace_line;

/// Figures from the tracer's own `statistics` record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportedStatistics {
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub average_allocation: u64,
    pub allocating_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u64>,
    pub address: String,
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    /// Lowercase hex SHA-256 of the trace bytes.
    pub sha256: String,
    pub lines: usize,
    /// Lines that failed validation and were skipped.
    pub invalid_lines: usize,
    pub event_counts: BTreeMap<String, u64>,
    /// Recomputed from allocate / zero_allocate / resize events.
    pub replayed_bytes_allocated: u64,
    /// Recomputed from release events and the old half of each resize.
    pub replayed_bytes_freed: u64,
    pub replayed_allocating_calls: u64,
    /// Sum of every `statistics` record in the trace.
    pub reported: Option<ReportedStatistics>,
    pub leaks: Vec<LeakEntry>,
    /// invalid_free + double_free + resize_of_unknown + resize_of_released.
    pub anomalies: u64,
    pub degraded: bool,
    /// Every attach has a matching detach.
    pub detached: bool,
    pub attaches: u64,
    pub detaches: u64,
}

impl TraceSummary {
    #[must_use]
    pub fn count(&self, event: &str) -> u64 {
        self.event_counts.get(event).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn leaked_bytes(&self) -> u64 {
        self.leaks.iter().map(|l| l.size).sum()
    }

    /// Whether the replayed totals agree with the reported statistics.
    ///
    /// `None` when there is nothing to compare: no statistics record, or
    /// per-call events were suppressed.
    #[must_use]
    pub fn consistent(&self) -> Option<bool> {
        let reported = self.reported?;
        if self.replayed_allocating_calls == 0 && reported.allocating_calls > 0 {
            return None;
        }
        Some(
            reported.bytes_allocated == self.replayed_bytes_allocated
                && reported.bytes_freed == self.replayed_bytes_freed
                && reported.allocating_calls == self.replayed_allocating_calls,
        )
    }

    /// Human-readable rendering.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "trace sha256      {}", self.sha256);
        let _ = writeln!(
            out,
            "lines             {} ({} invalid)",
            self.lines, self.invalid_lines
        );
        let _ = writeln!(out, "events");
        for (event, count) in &self.event_counts {
            let _ = writeln!(out, "  {event:<20} {count}");
        }
        let _ = writeln!(
            out,
            "replayed          allocated {} / freed {} / calls {}",
            self.replayed_bytes_allocated, self.replayed_bytes_freed, self.replayed_allocating_calls
        );
        if let Some(r) = self.reported {
            let _ = writeln!(
                out,
                "reported          allocated {} / freed {} / avg {} / calls {}",
                r.bytes_allocated, r.bytes_freed, r.average_allocation, r.allocating_calls
            );
        }
        let verdict = match self.consistent() {
            Some(true) => "yes",
            Some(false) => "NO",
            None => "n/a",
        };
        let _ = writeln!(out, "consistent        {verdict}");
        let _ = writeln!(out, "anomalies         {}", self.anomalies);
        let _ = writeln!(
            out,
            "leaks             {} blocks, {} bytes",
            self.leaks.len(),
            self.leaked_bytes()
        );
        for leak in &self.leaks {
            let _ = writeln!(out, "  {:<20} {}", leak.address, leak.size);
        }
        if self.degraded {
            let _ = writeln!(out, "tracing degraded: ledger exhausted, later calls untraced");
        }
        if !self.detached {
            let _ = writeln!(out, "no detach record: trace is truncated");
        }
        out
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn field_u64(obj: &Map<String, Value>, field: &str) -> u64 {
    obj.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn field_str<'a>(obj: &'a Map<String, Value>, field: &str) -> &'a str {
    obj.get(field).and_then(Value::as_str).unwrap_or_default()
}

type LiveKey = (Option<u64>, String);

/// Fold one event into `summary`. `live` tracks block sizes by pid and
/// address so the old half of a resize can be credited as freed, as the
/// tracer does.
fn replay(summary: &mut TraceSummary, live: &mut HashMap<LiveKey, u64>, obj: &Map<String, Value>) {
    let Some(event) = obj.get("event").and_then(Value::as_str) else {
        return;
    };
    *summary.event_counts.entry(event.to_string()).or_insert(0) += 1;
    let pid = obj.get("pid").and_then(Value::as_u64);
    let key = |field: &str| (pid, field_str(obj, field).to_string());

    match event {
        "allocate" | "zero_allocate" | "resize" => {
            if event == "resize"
                && let Some(old) = live.remove(&key("old_address"))
            {
                summary.replayed_bytes_freed += old;
            }
            let size = if event == "zero_allocate" {
                field_u64(obj, "count").saturating_mul(field_u64(obj, "elem_size"))
            } else {
                field_u64(obj, "size")
            };
            summary.replayed_bytes_allocated += size;
            summary.replayed_allocating_calls += 1;
            // A still-live address handed out again was freed off the books.
            if let Some(stale) = live.insert(key("address"), size) {
                summary.replayed_bytes_freed += stale;
            }
        }
        "release" => {
            summary.replayed_bytes_freed += field_u64(obj, "size");
            live.remove(&key("address"));
        }
        "invalid_free" | "double_free" | "resize_of_unknown" | "resize_of_released" => {
            summary.anomalies += 1;
        }
        "tracer_degraded" => summary.degraded = true,
        "leak" => summary.leaks.push(LeakEntry {
            pid,
            address: field_str(obj, "address").to_string(),
            size: field_u64(obj, "size"),
        }),
        "statistics" => {
            let total = summary.reported.get_or_insert_with(ReportedStatistics::default);
            total.bytes_allocated += field_u64(obj, "bytes_allocated");
            total.bytes_freed += field_u64(obj, "bytes_freed");
            total.allocating_calls += field_u64(obj, "allocating_calls");
            total.average_allocation = total
                .bytes_allocated
                .checked_div(total.allocating_calls)
                .unwrap_or(0);
        }
        "attach" => summary.attaches += 1,
        "detach" => summary.detaches += 1,
        _ => {}
    }
}

/// Summarize a trace held in memory. Invalid lines are counted and skipped.
#[must_use]
pub fn summarize_bytes(content: &[u8]) -> TraceSummary {
    let mut summary = TraceSummary {
        sha256: hex_lower(&sha2::Sha256::digest(content)),
        ..TraceSummary::default()
    };
    let mut live = HashMap::new();
    let text = String::from_utf8_lossy(content);
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        summary.lines += 1;
        match validate_trace_line(line, i + 1) {
            Ok(obj) => replay(&mut summary, &mut live, &obj),
            Err(_) => summary.invalid_lines += 1,
        }
    }
    summary.detached = summary.detaches > 0 && summary.detaches >= summary.attaches;
    summary
}

pub fn summarize_file(path: &Path) -> Result<TraceSummary, HarnessError> {
    let content = std::fs::read(path).map_err(|e| HarnessError::io(path, e))?;
    Ok(summarize_bytes(&content))
}
