//! Benchmark: bump allocation and minor collection pause times.

use criterion::{criterion_group, criterion_main, Criterion};
use nursery_gc::{CollectReason, Nursery, NurseryConfig, ObjectKind, Runtime, TypeId, Value};
use std::hint::black_box;

fn node_type(rt: &mut Runtime) -> TypeId {
    rt.register_type("Node", ObjectKind::Plain, 48, &[32])
}

fn bench_bump_fast_path(c: &mut Criterion) {
    let mut nursery = Nursery::new(NurseryConfig::default(), 0).unwrap();
    c.bench_function("bump_allocate_48", |b| {
        b.iter(|| {
            if let Some(ptr) = nursery.allocate(black_box(48)) {
                black_box(ptr);
            } else {
                nursery = Nursery::new(NurseryConfig::default(), 0).unwrap();
            }
        });
    });
}

fn bench_collect_garbage(c: &mut Criterion) {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = node_type(&mut rt);
    c.bench_function("minor_gc_10000_dead", |b| {
        b.iter(|| {
            for _ in 0..10_000 {
                black_box(rt.new_object(ty, 0));
            }
            rt.collect(CollectReason::Api, None);
        });
    });
}

fn bench_collect_survivors(c: &mut Criterion) {
    let mut rt = Runtime::new(NurseryConfig::default()).unwrap();
    let ty = node_type(&mut rt);
    let root = rt.roots_mut().add(Value::NULL);
    c.bench_function("minor_gc_1000_live_chain", |b| {
        b.iter(|| {
            let mut head = Value::NULL;
            for _ in 0..1000 {
                let node = rt.new_object(ty, 0);
                unsafe { node.set_field(32, head) };
                head = Value::from_cell(node);
            }
            rt.roots_mut().set(root, head);
            rt.collect(CollectReason::Api, None);
        });
    });
}

criterion_group!(
    benches,
    bench_bump_fast_path,
    bench_collect_garbage,
    bench_collect_survivors
);
criterion_main!(benches);
