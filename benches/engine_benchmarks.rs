//! Performance benchmarks for the metajit engine
//!
//! Run with: cargo bench
//!
//! These benchmarks compare plain interpretation against specialized
//! execution and measure the cost of one specialization attempt.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use metajit::bytecode::{BinaryOp, FunctionBuilder, Location, Program};
use metajit::jit::{CodeCache, Dispatcher, ExecutionState, HotnessCounters, JitConfig, Specializer};
use metajit::runtime::{Bindings, Effects, Value};
use std::sync::Arc;

/// acc = sum of (i % 4) * (i % 4) for i in 0..n, promoting i % 4
fn promoted_sum(n: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.konst(5, Value::Int(4));
    b.konst(7, Value::Int(0));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.binary(BinaryOp::Rem, 4, 0, 5);
    b.promote(4);
    b.mul(6, 4, 4);
    b.add(7, 7, 6);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(7);
    Arc::new(Program::single(b.build().unwrap()).unwrap())
}

fn run(program: &Arc<Program>, config: &JitConfig) -> Value {
    let mut dispatcher = Dispatcher::new(program.clone(), config.clone()).unwrap();
    dispatcher.run_program(&mut Effects::new()).unwrap()
}

/// Benchmark: interpretation vs specialization over growing loops
fn bench_loops(c: &mut Criterion) {
    let mut group = c.benchmark_group("loops");
    let interpreted = JitConfig::interpreted_only();
    let specialized = JitConfig::default();

    for size in [100i64, 1_000, 10_000].iter() {
        let program = promoted_sum(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("interpreted", size), &program, |b, program| {
            b.iter(|| run(black_box(program), &interpreted))
        });
        group.bench_with_input(BenchmarkId::new("specialized", size), &program, |b, program| {
            b.iter(|| run(black_box(program), &specialized))
        });
    }
    group.finish();
}

/// Benchmark: a warm cache shared by fresh dispatchers
fn bench_warm_cache(c: &mut Criterion) {
    let program = promoted_sum(1_000);
    let config = JitConfig::default();
    let cache = Arc::new(CodeCache::new(config.megamorphic_threshold));
    let mut warmup = Dispatcher::new(program.clone(), config.clone())
        .unwrap()
        .with_cache(cache.clone());
    warmup.run_program(&mut Effects::new()).unwrap();

    c.bench_function("warm_cache_1000", |b| {
        b.iter(|| {
            let mut dispatcher = Dispatcher::new(program.clone(), config.clone())
                .unwrap()
                .with_cache(cache.clone());
            dispatcher.run_program(&mut Effects::new()).unwrap()
        })
    });
}

/// Benchmark: one specialization of the loop body
fn bench_specialize(c: &mut Criterion) {
    let program = promoted_sum(1_000);
    let config = JitConfig::default();
    let counters = HotnessCounters::new();
    let cache = CodeCache::default();
    let bindings = Bindings::new(8);
    let head = Location::new(0, 5);

    c.bench_function("specialize_loop_body", |b| {
        b.iter(|| {
            let state = ExecutionState::at_merge_point(head, &[], black_box(&bindings));
            Specializer::new(&program, &config, &counters, &cache)
                .specialize(state)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_loops, bench_warm_cache, bench_specialize);
criterion_main!(benches);
