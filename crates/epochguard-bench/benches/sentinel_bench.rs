//! Sentinel scan cost.
//!
//! The epoch-end scan should grow with the number of live canaries, not with
//! the heap size. Each case allocates `n` objects and times one full
//! `check_heap_overflow` pass.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use epochguard_membrane::GuardedHeap;
use epochguard_membrane::config::detection_level;

#[derive(Default)]
struct BenchStats {
    samples_ns_per_op: Vec<f64>,
}

impl BenchStats {
    fn record(&mut self, iters: u64, dur: Duration) {
        self.samples_ns_per_op.push(dur.as_nanos() as f64 / iters as f64);
    }

    fn report(&self, bench_label: &str, objects: usize) {
        let mut samples = self.samples_ns_per_op.clone();
        if samples.is_empty() {
            return;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p50 = percentile_sorted(&samples, 0.50);
        let p95 = percentile_sorted(&samples, 0.95);
        println!(
            "SENTINEL_BENCH mode={:?} bench={} objects={} samples={} p50_ns_op={:.3} p95_ns_op={:.3} p50_ns_per_object={:.3}",
            detection_level(),
            bench_label,
            objects,
            samples.len(),
            p50,
            p95,
            p50 / objects as f64
        );
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn maybe_pin_thread() {
    if std::env::var("EPOCHGUARD_BENCH_PIN").ok().as_deref() != Some("1") {
        return;
    }
    // SAFETY: best-effort pinning for benchmarking determinism.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(0, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            eprintln!("SENTINEL_BENCH_META pinning_failed");
        }
    }
}

fn bench_scan(c: &mut Criterion) {
    maybe_pin_thread();
    let mut group = c.benchmark_group("sentinel_scan");

    for &objects in &[64usize, 1024, 16384] {
        let heap = GuardedHeap::with_capacity(1 << 28).expect("reserve heap");
        for i in 0..objects {
            black_box(heap.malloc(16 + (i % 7) * 24).expect("malloc"));
        }
        group.throughput(Throughput::Elements(objects as u64));
        let stats = RefCell::new(BenchStats::default());
        group.bench_with_input(BenchmarkId::new("clean_heap", objects), &heap, |b, heap| {
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    black_box(heap.check_heap_overflow());
                }
                let dur = start.elapsed().max(Duration::from_nanos(1));
                stats.borrow_mut().record(iters, dur);
                dur
            });
        });
        stats.borrow().report("clean_heap", objects);
    }

    // Same live object count, ten times the heap footprint.
    let heap = GuardedHeap::with_capacity(1 << 28).expect("reserve heap");
    let mut keep = Vec::new();
    for i in 0..10_240usize {
        let p = heap.malloc(64).expect("malloc");
        if i % 10 == 0 {
            keep.push(p);
        } else if let epochguard_membrane::FreeOutcome::Freed(obj) = heap.free(p) {
            // Never released, so the freed blocks stay as holes.
            black_box(obj);
        }
    }
    group.throughput(Throughput::Elements(keep.len() as u64));
    group.bench_function("sparse_heap", |b| b.iter(|| black_box(heap.check_heap_overflow())));

    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
