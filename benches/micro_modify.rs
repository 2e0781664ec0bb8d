//! Micro benchmarks for single-key modify operations.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use larch::{BTreeOptions, BTreeSlice, PageStore, Pager, PagerOptions, Synchronous};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const KEY_COUNT: u64 = 4_096;
const VALUE_LEN: usize = 48;
const LARGE_VALUE_LEN: usize = 3_000;

fn fresh_slice() -> BTreeSlice {
    let pager = Pager::in_memory(PagerOptions {
        synchronous: Synchronous::Off,
        ..PagerOptions::default()
    })
    .expect("in-memory pager");
    let store: Arc<dyn PageStore> = Arc::new(pager);
    BTreeSlice::open(store, BTreeOptions::default()).expect("open tree")
}

fn key(i: u64) -> Vec<u8> {
    format!("key:{i:08}").into_bytes()
}

fn loaded_slice(count: u64) -> BTreeSlice {
    let slice = fresh_slice();
    for i in 0..count {
        slice.set(&key(i), &[b'v'; VALUE_LEN], 0).expect("set");
    }
    slice
}

fn micro_modify(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/modify");
    group.sample_size(20);

    group.throughput(Throughput::Elements(KEY_COUNT));
    group.bench_function("sequential_set", |b| {
        b.iter_batched(
            fresh_slice,
            |slice| {
                for i in 0..KEY_COUNT {
                    slice.set(&key(i), &[b'v'; VALUE_LEN], 0).expect("set");
                }
                black_box(slice.stats().depth_last);
            },
            BatchSize::SmallInput,
        );
    });

    let mut shuffled: Vec<u64> = (0..KEY_COUNT).collect();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(0x1a_7c4));
    group.throughput(Throughput::Elements(KEY_COUNT));
    group.bench_function("random_delete", |b| {
        b.iter_batched(
            || loaded_slice(KEY_COUNT),
            |slice| {
                for i in &shuffled {
                    slice.delete(&key(*i)).expect("delete");
                }
                black_box(slice.stats().root_collapses);
            },
            BatchSize::SmallInput,
        );
    });

    let counters = fresh_slice();
    counters.set(b"hits", b"0", 0).expect("set");
    group.throughput(Throughput::Elements(1));
    group.bench_function("incr", |b| {
        b.iter(|| black_box(counters.incr(b"hits", 1).expect("incr")));
    });

    let large = fresh_slice();
    let payload = vec![b'L'; LARGE_VALUE_LEN];
    large.set(b"blob", &payload, 0).expect("set");
    group.throughput(Throughput::Bytes(LARGE_VALUE_LEN as u64));
    group.bench_function("large_overwrite", |b| {
        b.iter(|| black_box(large.set(b"blob", &payload, 0).expect("set")));
    });

    let lookups = loaded_slice(KEY_COUNT);
    group.throughput(Throughput::Elements(1));
    group.bench_function("get", |b| {
        let mut next = 0u64;
        b.iter(|| {
            next = (next + 7919) % KEY_COUNT;
            black_box(lookups.get(&key(next)).expect("get"))
        });
    });

    group.finish();
}

criterion_group!(benches, micro_modify);
criterion_main!(benches);
