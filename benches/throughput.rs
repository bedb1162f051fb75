//! Throughput benchmarks for forkline.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main,
};
use forkline::engine::Registry;
use forkline::execution::{Envelope, Initializer, frame_message, unframe_message};
use forkline::value::Value;
use forkline::worker::WorkerExecutor;
use std::hint::black_box;

fn bound(method: &str, args: &[Value]) -> WorkerExecutor {
    let mut executor = WorkerExecutor::new(Registry::with_builtins());
    let mut out = Vec::new();
    executor.init(&Initializer::named("arith")).unwrap();
    executor.use_method(method, args, &mut out).unwrap();
    executor
}

fn bench_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor");

    for (method, function) in [("map", "square"), ("filterMap", "double_if_even")] {
        for count in [100usize, 10_000] {
            group.throughput(Throughput::Elements(count as u64));
            group.bench_with_input(
                BenchmarkId::new(method, count),
                &count,
                |b, &count| {
                    // Filtered items stay pending until close, so each batch
                    // starts from a fresh executor.
                    b.iter_batched(
                        || bound(method, &[function.into()]),
                        |mut executor| {
                            let mut out = Vec::with_capacity(count);
                            for i in 0..count as i64 {
                                executor.process(Value::Int(i), &mut out).unwrap();
                            }
                            black_box(out.len())
                        },
                        BatchSize::SmallInput,
                    );
                },
            );
        }
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for batch in [1usize, 64, 1024] {
        let envelope = Envelope::Push {
            values: (0..batch as i64).map(Value::Int).collect(),
        };
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("frame", batch), &envelope, |b, envelope| {
            b.iter(|| black_box(frame_message(envelope).unwrap()));
        });

        let framed = frame_message(&envelope).unwrap();
        group.bench_with_input(BenchmarkId::new("unframe", batch), &framed, |b, framed| {
            b.iter(|| black_box(unframe_message(framed).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_executor, bench_framing);
criterion_main!(benches);
