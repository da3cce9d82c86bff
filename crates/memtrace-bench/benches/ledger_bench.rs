//! Ledger benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use memtrace_core::Ledger;

fn bench_record_release_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_record_release");

    // Reusing one address exercises the revive-in-place path.
    group.bench_function("same_address", |b| {
        let mut ledger = Ledger::new();
        b.iter(|| {
            ledger.record_allocation(0x1000, 64).expect("record");
            criterion::black_box(ledger.record_release(0x1000));
        });
    });

    group.bench_function("fresh_addresses_1000", |b| {
        b.iter(|| {
            let mut ledger = Ledger::new();
            for i in 0..1000usize {
                ledger.record_allocation(0x1000 + i * 16, 16).expect("record");
            }
            for i in 0..1000usize {
                criterion::black_box(ledger.record_release(0x1000 + i * 16));
            }
            ledger.destroy();
        });
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_find");

    for &records in &[1_000usize, 100_000] {
        let mut ledger = Ledger::new();
        for i in 0..records {
            ledger.record_allocation(0x10_0000 + i * 32, 32).expect("record");
        }
        group.bench_with_input(BenchmarkId::new("hit", records), &records, |b, &n| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 7919) % n;
                criterion::black_box(ledger.find(0x10_0000 + i * 32));
            });
        });
        group.bench_with_input(BenchmarkId::new("live_bytes", records), &records, |b, _| {
            b.iter(|| criterion::black_box(ledger.live_bytes()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record_release_cycle, bench_lookup);
criterion_main!(benches);
