//! Throughput benchmarks for the buffering queue
//!
//! - push/pop through a memory-only queue
//! - push/pop with spilling into a disk ring
//! - range reads stitched across disk and memory

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use remotemedia_buffer_queue::{FlowController, QueueConfig, StreamItem};
use std::time::Duration;

fn bench_memory_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_push_pop");
    group.measurement_time(Duration::from_secs(5));

    for chunk_size in [188usize, 4096, 65536] {
        let queue = FlowController::new("bench-memory", QueueConfig::bytes_only(0)).unwrap();
        let payload = bytes::Bytes::from(vec![0u8; chunk_size]);

        group.throughput(Throughput::Bytes(chunk_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, _| {
                b.iter(|| {
                    queue.push(StreamItem::data(payload.clone())).unwrap();
                    black_box(queue.pop().unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_ring_spill(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_spill");
    group.measurement_time(Duration::from_secs(5));

    for chunk_size in [4096usize, 65536] {
        let config = QueueConfig::bytes_only(256 * 1024).with_ring_buffer(16 * 1024 * 1024);
        let queue = FlowController::new("bench-ring", config).unwrap();
        let payload = bytes::Bytes::from(vec![0u8; chunk_size]);

        // Keep memory full so every push spills
        while queue.stats().spilled_bytes == 0 {
            queue.push(StreamItem::data(payload.clone())).unwrap();
        }

        group.throughput(Throughput::Bytes(chunk_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, _| {
                b.iter(|| {
                    queue.push(StreamItem::data(payload.clone())).unwrap();
                    black_box(queue.pop().unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_range_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_read");

    let config = QueueConfig::bytes_only(64 * 1024).with_ring_buffer(4 * 1024 * 1024);
    let queue = FlowController::new("bench-range", config).unwrap();
    for i in 0..256u32 {
        queue.push(StreamItem::data(vec![i as u8; 4096])).unwrap();
    }
    let end = queue.write_offset();

    for length in [4096u64, 65536] {
        group.throughput(Throughput::Bytes(length));

        group.bench_with_input(BenchmarkId::new("memory", length), &length, |b, &len| {
            b.iter(|| black_box(queue.range_read(end - len, len).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("disk", length), &length, |b, &len| {
            b.iter(|| black_box(queue.range_read(4096, len).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_push_pop,
    bench_ring_spill,
    bench_range_read
);
criterion_main!(benches);
