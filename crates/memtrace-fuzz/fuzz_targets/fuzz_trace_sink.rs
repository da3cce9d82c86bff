#![no_main]
//! Text and JSONL rendering of arbitrary events never panics, and every
//! JSONL line parses back as an object with the event tag.

use libfuzzer_sys::fuzz_target;
use memtrace_membrane::{Addr, EventSink, LogFormat, Primitive, StreamSink, TraceEvent};

fn event_from(bytes: &[u8]) -> TraceEvent {
    let word = |i: usize| {
        let mut buf = [0u8; 8];
        for (j, b) in buf.iter_mut().enumerate() {
            *b = bytes.get(i * 8 + j + 1).copied().unwrap_or(0);
        }
        usize::from_le_bytes(buf)
    };
    match bytes.first().copied().unwrap_or(0) % 8 {
        0 => TraceEvent::Allocate {
            size: word(0),
            address: Addr(word(1)),
        },
        1 => TraceEvent::ZeroAllocate {
            count: word(0),
            elem_size: word(1),
            address: Addr(word(2)),
        },
        2 => TraceEvent::Resize {
            old_address: Addr(word(0)),
            size: word(1),
            address: Addr(word(2)),
        },
        3 => TraceEvent::DoubleFree {
            address: Addr(word(0)),
            size: word(1),
        },
        4 => TraceEvent::InvalidFree {
            address: Addr(word(0)),
        },
        5 => TraceEvent::AllocationFailed {
            primitive: Primitive::Realloc,
            size: word(0),
        },
        6 => TraceEvent::TracerDegraded {
            reason: String::from_utf8_lossy(bytes).into_owned(),
        },
        _ => TraceEvent::Leak {
            address: Addr(word(0)),
            size: word(1),
            live_count: word(2) as u32,
        },
    }
}

fuzz_target!(|data: &[u8]| {
    let event = event_from(data);

    let mut text = StreamSink::new(Vec::new(), LogFormat::Text);
    text.emit(&event);
    assert_eq!(text.write_errors(), 0);

    let mut jsonl = StreamSink::new(Vec::new(), LogFormat::Jsonl);
    jsonl.emit(&event);
    let out = jsonl.into_inner();
    let value: serde_json::Value = match serde_json::from_slice(&out) {
        Ok(v) => v,
        Err(e) => panic!("unparseable jsonl line: {e}"),
    };
    assert_eq!(value["event"], event.name());
});
