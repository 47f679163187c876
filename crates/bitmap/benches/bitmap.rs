// SPDX-License-Identifier: Apache-2.0

//! Allocation throughput of the hierarchical bitmap and the sharded pool.

use corun_bitmap::{Bitmap, SlotPool};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn bitmap_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap_alloc_free");

    for bits in [4_096usize, 1 << 20] {
        let _ = group.bench_function(format!("{bits}_bits"), |b| {
            let map = Bitmap::new(bits).expect("bitmap");
            b.iter(|| {
                let bit = map.alloc().expect("free bit");
                map.free(black_box(bit)).expect("free");
            });
        });
    }

    group.finish();
}

fn bitmap_full_scan(c: &mut Criterion) {
    let _ = c.bench_function("bitmap_alloc_near_full", |b| {
        let map = Bitmap::new(1 << 20).expect("bitmap");
        while map.alloc().is_some() {}
        map.free((1 << 20) - 1).expect("free");

        // Worst case: the only free bit sits at the very end.
        b.iter(|| {
            let bit = map.alloc().expect("last bit");
            map.free(black_box(bit)).expect("free");
        });
    });
}

fn slot_pool_round_trip(c: &mut Criterion) {
    let _ = c.bench_function("slot_pool_round_trip", |b| {
        let pool: SlotPool<u64> = SlotPool::new(65_536).expect("pool");
        b.iter(|| {
            let slot = pool.try_alloc(black_box(7)).expect("slot");
            let _ = pool.free(slot).expect("value");
        });
    });
}

criterion_group!(
    benches,
    bitmap_alloc_free,
    bitmap_full_scan,
    slot_pool_round_trip
);
criterion_main!(benches);
