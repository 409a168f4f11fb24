//! Benchmarks for the shadow heap allocation paths.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shadowheap::{HeapConfig, ResizeMode, ShadowHeap};

fn heap(quarantine: usize) -> ShadowHeap {
    let config = HeapConfig::default()
        .with_stack_capture(false)
        .with_quarantine_max_size(quarantine);
    ShadowHeap::new(config).expect("arena")
}

fn bench_allocate_free(c: &mut Criterion) {
    let heap = heap(1 << 20);

    let mut group = c.benchmark_group("allocate_free");

    for size in [8usize, 64, 1024, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = heap.allocate(black_box(size)).unwrap();
                heap.free(p.as_ptr()).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_aligned(c: &mut Criterion) {
    let heap = heap(1 << 20);

    let mut group = c.benchmark_group("allocate_aligned");

    for align in [16usize, 64, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(align), &align, |b, &align| {
            b.iter(|| {
                let p = heap.allocate_aligned(100, black_box(align)).unwrap();
                heap.free(p.as_ptr()).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_quarantine_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("quarantine");

    // Every free evicts the previous block.
    let tight = heap(0);
    group.bench_function("evict_every_free", |b| {
        b.iter(|| {
            let p = tight.allocate(black_box(256)).unwrap();
            tight.free(p.as_ptr()).unwrap();
        })
    });

    let roomy = heap(8 << 20);
    group.bench_function("batch_100_then_free", |b| {
        b.iter(|| {
            let ptrs: Vec<_> = (0..100).map(|_| roomy.allocate(64).unwrap()).collect();
            for p in ptrs {
                roomy.free(p.as_ptr()).unwrap();
            }
        })
    });

    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let heap = heap(1 << 20);

    c.bench_function("resize_grow_64_to_128", |b| {
        b.iter(|| {
            let p = heap.allocate(64).unwrap();
            let q = heap.resize(p.as_ptr(), black_box(128), ResizeMode::Move).unwrap();
            heap.free(q.as_ptr()).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_allocate_free,
    bench_aligned,
    bench_quarantine_pressure,
    bench_resize,
);
criterion_main!(benches);
