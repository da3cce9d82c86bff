#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::ffi::c_void;

use memtrace_membrane::{
    Addr, EventSink, LogFormat, Mode, RealAllocator, RecordingSink, StreamSink, TraceEvent,
    TracerConfig, TracerState,
};

/// Fake allocator over synthetic addresses.
///
/// Fresh blocks come from a bump counter; `reuse` queues addresses to hand
/// out next (as a real allocator does with recently freed blocks), and
/// `fail_next` makes the next allocating call return null.
#[derive(Default)]
struct FakeAllocator {
    next: usize,
    reuse: VecDeque<usize>,
    fail_next: u32,
    released: Vec<usize>,
    resize_calls: Vec<(usize, usize)>,
}

impl FakeAllocator {
    fn fresh(&mut self) -> *mut c_void {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return std::ptr::null_mut();
        }
        if let Some(addr) = self.reuse.pop_front() {
            return addr as *mut c_void;
        }
        self.next += 0x40;
        (0x5000_0000 + self.next) as *mut c_void
    }

    fn release_count(&self, addr: usize) -> usize {
        self.released.iter().filter(|&&a| a == addr).count()
    }
}

impl RealAllocator for FakeAllocator {
    fn allocate(&mut self, _size: usize) -> *mut c_void {
        self.fresh()
    }

    fn zero_allocate(&mut self, count: usize, elem_size: usize) -> *mut c_void {
        if count.checked_mul(elem_size).is_none() {
            return std::ptr::null_mut();
        }
        self.fresh()
    }

    unsafe fn resize(&mut self, ptr: *mut c_void, size: usize) -> *mut c_void {
        self.resize_calls.push((ptr as usize, size));
        if size == 0 && !ptr.is_null() {
            self.released.push(ptr as usize);
            return std::ptr::null_mut();
        }
        self.fresh()
    }

    unsafe fn release(&mut self, ptr: *mut c_void) {
        self.released.push(ptr as usize);
    }
}

fn attach() -> TracerState<FakeAllocator, RecordingSink> {
    TracerState::attach(
        FakeAllocator::default(),
        RecordingSink::new(),
        &TracerConfig::default(),
    )
}

fn names(sink: &RecordingSink) -> Vec<&'static str> {
    sink.events().iter().map(TraceEvent::name).collect()
}

#[test]
fn accounting_identity_after_releases() {
    let mut t = attach();
    let a = t.allocate(100);
    let b = t.zero_allocate(3, 7);
    let c = t.allocate(1);
    unsafe {
        t.release(b);
        t.release(a);
    }
    assert_eq!(t.bytes().allocated, 122);
    assert_eq!(t.bytes().freed, 121);
    assert_eq!(t.bytes().outstanding(), t.ledger().live_bytes());
    assert_eq!(t.ledger().find(c as usize).map(|r| r.size), Some(1));
}

#[test]
fn reused_address_keeps_a_single_record() {
    let mut t = attach();
    let first = t.allocate(16);
    unsafe { t.release(first) };
    t.real_reuse(first as usize);
    let second = t.allocate(48);

    assert_eq!(first, second);
    assert_eq!(t.ledger().len(), 1);
    let record = t.ledger().find(second as usize).expect("record");
    assert_eq!(record.size, 48);
    assert_eq!(record.live_count, 1);
}

#[test]
fn double_free_is_reported_and_not_forwarded() {
    let mut t = attach();
    let p = t.allocate(24);
    unsafe {
        t.release(p);
        t.release(p);
    }
    assert_eq!(t.sink().count("double_free"), 1);
    assert_eq!(t.calls().double_releases, 1);
    assert_eq!(t.real().release_count(p as usize), 1);
    let event = t.sink().events().last().expect("event");
    assert_eq!(
        *event,
        TraceEvent::DoubleFree {
            address: Addr(p as usize),
            size: 24
        }
    );
}

#[test]
fn invalid_free_is_reported_and_not_forwarded() {
    let mut t = attach();
    let bogus = 0xdead_0000usize as *mut c_void;
    unsafe { t.release(bogus) };
    assert_eq!(t.sink().count("invalid_free"), 1);
    assert_eq!(t.calls().invalid_releases, 1);
    assert!(t.real().released.is_empty());
    assert!(t.ledger().is_empty());
}

#[test]
fn unreleased_block_is_reported_as_leak() {
    let mut t = attach();
    let p = t.allocate(10);
    let (report, sink) = t.finalize();
    assert_eq!(report.leaks.len(), 1);
    assert_eq!(report.leaks[0].address, p as usize);
    assert_eq!(report.leaks[0].size, 10);
    assert_eq!(sink.count("leak"), 1);
    assert_eq!(sink.count("leak_report_start"), 1);
}

#[test]
fn null_release_touches_nothing() {
    let mut t = attach();
    unsafe { t.release(std::ptr::null_mut()) };
    assert_eq!(names(t.sink()), ["attach"]);
    assert!(t.real().released.is_empty());
    assert_eq!(t.calls().release, 0);
    assert_eq!(t.calls().invalid_releases, 0);
}

#[test]
fn scenario_two_allocations_one_release() {
    let mut t = attach();
    let a = t.allocate(64);
    let b = t.allocate(32);
    unsafe { t.release(a) };
    let (report, sink) = t.finalize();

    assert_eq!(report.statistics.bytes_allocated, 96);
    assert_eq!(report.statistics.bytes_freed, 64);
    assert_eq!(report.statistics.average_allocation, 48);
    assert_eq!(report.leaks.len(), 1);
    assert_eq!(report.leaks[0].address, b as usize);
    assert_eq!(report.leaks[0].size, 32);
    assert!(!report.degraded);
    assert_eq!(
        names(&sink),
        [
            "attach",
            "allocate",
            "allocate",
            "release",
            "statistics",
            "leak_report_start",
            "leak",
            "detach"
        ]
    );
}

#[test]
fn scenario_calloc_then_double_release() {
    let mut t = attach();
    let c = t.zero_allocate(4, 8);
    unsafe {
        t.release(c);
        t.release(c);
    }
    assert_eq!(t.bytes().allocated, 32);
    assert_eq!(t.bytes().freed, 32, "freed only once");
    assert_eq!(t.sink().count("double_free"), 1);
    let (report, sink) = t.finalize();
    assert!(report.leaks.is_empty());
    assert_eq!(sink.count("leak_report_start"), 0);
}

#[test]
fn scenario_resize_of_unknown_address() {
    let mut t = attach();
    let d = 0x7777_0000usize as *mut c_void;
    let p = unsafe { t.resize(d, 128) };

    assert!(!p.is_null());
    assert_eq!(t.real().resize_calls, [(d as usize, 128)]);
    assert_eq!(t.ledger().find(p as usize).map(|r| r.size), Some(128));
    assert!(t.ledger().find(d as usize).is_none());
    assert_eq!(t.calls().unknown_resizes, 1);
    assert_eq!(t.bytes().freed, 0);
    assert_eq!(
        names(t.sink()),
        ["attach", "resize_of_unknown", "resize"]
    );
}

#[test]
fn resize_moves_the_record() {
    let mut t = attach();
    let p = t.allocate(16);
    let q = unsafe { t.resize(p, 64) };
    assert_ne!(p, q);
    assert!(!t.ledger().find(p as usize).expect("old record").is_live());
    assert_eq!(t.ledger().find(q as usize).map(|r| r.size), Some(64));
    assert_eq!(t.bytes().allocated, 80);
    assert_eq!(t.bytes().freed, 16);
    assert_eq!(t.calls().allocating_calls(), 2);
    assert_eq!(t.bytes().outstanding(), t.ledger().live_bytes());
}

#[test]
fn resize_in_place_revives_same_record() {
    let mut t = attach();
    let p = t.allocate(16);
    t.real_reuse(p as usize);
    let q = unsafe { t.resize(p, 32) };
    assert_eq!(p, q);
    assert_eq!(t.ledger().len(), 1);
    let record = t.ledger().find(q as usize).expect("record");
    assert_eq!((record.size, record.live_count), (32, 1));
    assert_eq!(t.bytes().outstanding(), 32);
}

#[test]
fn failed_resize_leaves_old_block_live() {
    let mut t = attach();
    let p = t.allocate(16);
    t.real_fail_next(1);
    let q = unsafe { t.resize(p, 1 << 20) };

    assert!(q.is_null());
    let record = t.ledger().find(p as usize).expect("record");
    assert!(record.is_live());
    assert_eq!(record.size, 16);
    assert_eq!(t.bytes().freed, 0);
    assert_eq!(t.calls().failed, 1);
    assert_eq!(t.calls().resize, 0);
    assert_eq!(t.sink().count("allocation_failed"), 1);
}

#[test]
fn resize_to_zero_counts_as_release() {
    let mut t = attach();
    let p = t.allocate(40);
    let q = unsafe { t.resize(p, 0) };

    assert!(q.is_null());
    assert!(!t.ledger().find(p as usize).expect("record").is_live());
    assert_eq!(t.calls().release, 1);
    assert_eq!(t.calls().resize, 0);
    assert_eq!(t.bytes().freed, 40);
    assert_eq!(t.sink().count("release"), 1);

    unsafe { t.release(p) };
    assert_eq!(t.sink().count("double_free"), 1);
}

#[test]
fn resize_of_released_block_is_flagged() {
    let mut t = attach();
    let p = t.allocate(8);
    unsafe { t.release(p) };
    let q = unsafe { t.resize(p, 24) };
    assert!(!q.is_null());
    assert_eq!(t.sink().count("resize_of_released"), 1);
    assert_eq!(t.bytes().freed, 8, "no second credit for the stale block");
    assert_eq!(t.bytes().outstanding(), t.ledger().live_bytes());
}

#[test]
fn failed_allocations_count_separately() {
    let mut t = attach();
    t.real_fail_next(2);
    assert!(t.allocate(10).is_null());
    assert!(t.zero_allocate(2, 5).is_null());
    let p = t.allocate(30);
    assert!(!p.is_null());

    assert_eq!(t.calls().failed, 2);
    assert_eq!(t.calls().allocate, 1);
    assert_eq!(t.calls().zero_allocate, 0);
    assert_eq!(t.bytes().allocated, 30);
    assert_eq!(t.ledger().len(), 1);
    assert_eq!(t.statistics().average_allocation, 30);
}

#[test]
fn exhausted_ledger_degrades_to_pass_through() {
    let config = TracerConfig {
        max_records: 2,
        ..TracerConfig::default()
    };
    let mut t = TracerState::attach(FakeAllocator::default(), RecordingSink::new(), &config);
    let a = t.allocate(1);
    let _b = t.allocate(2);
    let c = t.allocate(3);
    assert!(!c.is_null(), "caller still gets its block");
    assert_eq!(t.mode(), Mode::PassThrough);
    assert!(t.is_degraded());

    let d = t.allocate(4);
    unsafe {
        t.release(c);
        t.release(a);
    }
    assert!(!d.is_null());
    assert_eq!(t.real().release_count(c as usize), 1, "forwarded untouched");
    assert_eq!(t.calls().allocate, 2);
    assert_eq!(t.sink().count("tracer_degraded"), 1);

    let (report, sink) = t.finalize();
    assert!(report.degraded);
    assert!(report.leaks.is_empty());
    assert_eq!(sink.count("leak"), 0);
    assert_eq!(names(&sink).last().copied(), Some("detach"));
}

#[test]
fn off_mode_forwards_everything() {
    let config = TracerConfig::from_lookup(|key| (key == "MEMTRACE_MODE").then(|| "off".into()));
    let mut t = TracerState::attach(FakeAllocator::default(), RecordingSink::new(), &config);
    assert_eq!(t.mode(), Mode::PassThrough);
    let p = t.allocate(12);
    unsafe {
        t.release(p);
        t.release(p);
    }
    assert_eq!(t.real().release_count(p as usize), 2);
    assert!(t.ledger().is_empty());
    assert_eq!(t.sink().count("double_free"), 0);
    let (report, _) = t.finalize();
    assert!(!report.degraded);
    assert_eq!(report.statistics.bytes_allocated, 0);
}

#[test]
fn jsonl_stream_of_a_full_session() {
    let config = TracerConfig {
        format: LogFormat::Jsonl,
        ..TracerConfig::default()
    };
    let sink = StreamSink::new(Vec::new(), config.format);
    let mut t = TracerState::attach(FakeAllocator::default(), sink, &config);
    let p = t.allocate(64);
    let _q = t.allocate(32);
    unsafe {
        t.release(p);
        t.release(0x10usize as *mut c_void);
    }
    let (_, mut sink) = t.finalize();
    sink.flush();
    assert_eq!(sink.write_errors(), 0);

    let text = String::from_utf8(sink.into_inner()).expect("utf8");
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    let events: Vec<&str> = lines
        .iter()
        .map(|v| v["event"].as_str().expect("event field"))
        .collect();
    assert_eq!(
        events,
        [
            "attach",
            "allocate",
            "allocate",
            "release",
            "invalid_free",
            "statistics",
            "leak_report_start",
            "leak",
            "detach"
        ]
    );
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["seq"], (i + 1) as u64);
    }
    assert_eq!(lines[4]["level"], "error");
    assert_eq!(lines[4]["address"], "0x10");
    assert_eq!(lines[5]["bytes_allocated"], 96);
    assert_eq!(lines[5]["average_allocation"], 48);
}

/// Test-only knobs on the fake, reached through the tracer.
trait FakeControl {
    fn real_reuse(&mut self, addr: usize);
    fn real_fail_next(&mut self, n: u32);
}

impl FakeControl for TracerState<FakeAllocator, RecordingSink> {
    fn real_reuse(&mut self, addr: usize) {
        self.real_mut().reuse.push_back(addr);
    }

    fn real_fail_next(&mut self, n: u32) {
        self.real_mut().fail_next = n;
    }
}
