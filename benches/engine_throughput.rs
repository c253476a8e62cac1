//! Throughput benchmarks for the hash engine (`Map`) and the lock-free
//! stack, run against a scratch backing file recreated per iteration so
//! each run starts from an empty collection.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use persist_collections::map::Map;
use persist_collections::stack::Stack;
use std::path::PathBuf;

const SEGMENT_SIZE: u64 = 64 << 20;
const BUCKET_COUNT: u32 = 4096;

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("persist_collections_bench_{name}_{}", std::process::id()))
}

fn map_put_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put", |bencher| {
        bencher.iter_batched(
            || {
                let path = scratch_path("put");
                let _ = std::fs::remove_file(&path);
                Map::open(&path, SEGMENT_SIZE, true, BUCKET_COUNT).unwrap()
            },
            |map| {
                for i in 0..256u32 {
                    map.put(&i.to_le_bytes(), b"benchmark-value", -1).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("get_hit", |bencher| {
        let path = scratch_path("get_hit");
        let _ = std::fs::remove_file(&path);
        let map = Map::open(&path, SEGMENT_SIZE, true, BUCKET_COUNT).unwrap();
        for i in 0..256u32 {
            map.put(&i.to_le_bytes(), b"benchmark-value", -1).unwrap();
        }
        bencher.iter(|| {
            for i in 0..256u32 {
                criterion::black_box(map.get(&i.to_le_bytes()));
            }
        });
        std::fs::remove_file(&path).ok();
    });

    group.finish();
}

fn stack_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("stack");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_pop", |bencher| {
        let path = scratch_path("push_pop");
        let _ = std::fs::remove_file(&path);
        let stack = Stack::open(&path, SEGMENT_SIZE, true).unwrap();
        bencher.iter(|| {
            stack.push(b"benchmark-payload", -1).unwrap();
            criterion::black_box(stack.pop().unwrap());
        });
        std::fs::remove_file(&path).ok();
    });

    group.finish();
}

criterion_group!(benches, map_put_get, stack_push_pop);
criterion_main!(benches);
