//! Event sinks: where [`TraceEvent`]s end up.
//!
//! - [`RecordingSink`] keeps events in memory (tests, embedding).
//! - [`NullSink`] drops them.
//! - [`StreamSink`] writes them to any `Write` as human-readable text or as
//!   JSONL (one object per line with `seq`, `level` and `event` fields, plus
//!   `pid` when the sink is tagged with a process id).
//!
//! Every event reaches the writer in a single `write_all`, so processes
//! appending to one file never split each other's records.
//!
//! A sink must never fail the traced call. Write errors are counted and
//! otherwise swallowed.

use std::io::Write;

use crate::config::LogFormat;
use crate::event::TraceEvent;

/// Consumer of trace events.
pub trait EventSink {
    fn emit(&mut self, event: &TraceEvent);

    /// Push buffered output to its destination.
    fn flush(&mut self) {}
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, event: &TraceEvent) {
        (**self).emit(event);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

/// Collects events in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Vec<TraceEvent>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// Number of recorded events with the given name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &TraceEvent) {}
}

/// Writes events to a byte stream.
pub struct StreamSink<W: Write> {
    writer: W,
    format: LogFormat,
    pid: Option<u32>,
    seq: u64,
    write_errors: u64,
    scratch: Vec<u8>,
}

impl<W: Write> StreamSink<W> {
    pub fn new(writer: W, format: LogFormat) -> Self {
        Self {
            writer,
            format,
            pid: None,
            seq: 0,
            write_errors: 0,
            scratch: Vec::new(),
        }
    }

    /// Tag every record with the writing process.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Number of events successfully handed to the writer.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_event(&mut self, seq: u64, event: &TraceEvent) -> std::io::Result<()> {
        self.scratch.clear();
        match self.format {
            LogFormat::Jsonl => {
                let line = jsonl_record(seq, self.pid, event).map_err(std::io::Error::other)?;
                self.scratch.extend_from_slice(line.as_bytes());
                self.scratch.push(b'\n');
            }
            LogFormat::Text => {
                let tag = match self.pid {
                    Some(pid) => format!("[{pid}:{seq:06}]"),
                    None => format!("[{seq:06}]"),
                };
                write_text(&mut self.scratch, &tag, event)?;
            }
        }
        self.writer.write_all(&self.scratch)
    }
}

impl<W: Write> EventSink for StreamSink<W> {
    fn emit(&mut self, event: &TraceEvent) {
        let seq = self.seq + 1;
        match self.write_event(seq, event) {
            Ok(()) => self.seq = seq,
            Err(_) => self.write_errors += 1,
        }
        if matches!(event, TraceEvent::Detach) {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.writer.flush().is_err() {
            self.write_errors += 1;
        }
    }
}

/// Serialize one event as a JSONL record (no trailing newline).
pub fn jsonl_line(seq: u64, event: &TraceEvent) -> Result<String, serde_json::Error> {
    jsonl_record(seq, None, event)
}

fn jsonl_record(
    seq: u64,
    pid: Option<u32>,
    event: &TraceEvent,
) -> Result<String, serde_json::Error> {
    let mut record = serde_json::Map::new();
    record.insert("seq".to_string(), seq.into());
    if let Some(pid) = pid {
        record.insert("pid".to_string(), pid.into());
    }
    record.insert("level".to_string(), event.severity().as_str().into());
    if let serde_json::Value::Object(fields) = serde_json::to_value(event)? {
        record.extend(fields);
    }
    serde_json::to_string(&serde_json::Value::Object(record))
}

fn write_text<W: Write>(w: &mut W, tag: &str, event: &TraceEvent) -> std::io::Result<()> {
    match event {
        TraceEvent::Attach { mode } => {
            writeln!(w, "{tag} memtrace attached (mode: {mode:?})")
        }
        TraceEvent::Detach => writeln!(w, "{tag} memtrace detached"),
        TraceEvent::Allocate { size, address } => {
            writeln!(w, "{tag}          malloc( {size} ) = {address}")
        }
        TraceEvent::ZeroAllocate {
            count,
            elem_size,
            address,
        } => writeln!(
            w,
            "{tag}          calloc( {count} , {elem_size} ) = {address}"
        ),
        TraceEvent::Resize {
            old_address,
            size,
            address,
        } => writeln!(
            w,
            "{tag}          realloc( {old_address} , {size} ) = {address}"
        ),
        TraceEvent::Release { address, size } => {
            writeln!(w, "{tag}          free( {address} )  [{size} bytes]")
        }
        TraceEvent::AllocationFailed { primitive, size } => writeln!(
            w,
            "{tag}    *** {}( {size} ) failed: real allocator returned null",
            primitive.symbol()
        ),
        TraceEvent::InvalidFree { address } => writeln!(
            w,
            "{tag}    *** ILLEGAL FREE: {address} was never allocated, ignored"
        ),
        TraceEvent::DoubleFree { address, size } => writeln!(
            w,
            "{tag}    *** DOUBLE FREE: {address} ({size} bytes) already freed, ignored"
        ),
        TraceEvent::ResizeOfUnknown { old_address, size } => writeln!(
            w,
            "{tag}    *** realloc( {old_address} , {size} ): old block was never allocated"
        ),
        TraceEvent::ResizeOfReleased { old_address, size } => writeln!(
            w,
            "{tag}    *** realloc( {old_address} , {size} ): old block was already freed"
        ),
        TraceEvent::TracerDegraded { reason } => writeln!(
            w,
            "{tag}    *** tracing stopped ({reason}); forwarding all further calls"
        ),
        TraceEvent::Statistics(stats) => {
            writeln!(w, "{tag} Statistics")?;
            writeln!(w, "           allocated_total      {}", stats.bytes_allocated)?;
            writeln!(w, "           allocated_avg        {}", stats.average_allocation)?;
            writeln!(w, "           freed_total          {}", stats.bytes_freed)
        }
        TraceEvent::LeakReportStart { blocks, bytes } => {
            writeln!(
                w,
                "{tag} Non-deallocated memory blocks ({blocks} blocks, {bytes} bytes)"
            )?;
            writeln!(
                w,
                "           {:<20} {:>12} {:>8}",
                "block", "size", "ref cnt"
            )
        }
        TraceEvent::Leak {
            address,
            size,
            live_count,
        } => writeln!(
            w,
            "           {:<20} {:>12} {:>8}",
            address.to_string(),
            size,
            live_count
        ),
    }
}
