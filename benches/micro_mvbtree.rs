//! Micro benchmarks for the multi-value tree.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use mvbtree::storage::mvbtree::EMBEDDED_ITEMS_THRESHOLD;
use mvbtree::{
    run_atomic, Key, KeyDefinition, KeyType, MemPager, MultiValueTree, PagerOptions, Rid,
    TreeOptions,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: i64 = 16_384;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: i64 = 512;

fn micro_mvbtree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/mvbtree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("sequential_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.put_sequence(0, INSERT_COUNT);
                black_box(tree.size());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<i64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("random_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.put_keys(&random_keys);
                black_box(tree.size());
            },
            BatchSize::SmallInput,
        );
    });

    let spilled = EMBEDDED_ITEMS_THRESHOLD as i64 * 8;
    group.throughput(Throughput::Elements(spilled as u64));
    group.bench_function("overflow_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |tree| {
                tree.put_duplicates(spilled);
                black_box(tree.size());
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("remove_random", |b| {
        b.iter_batched(
            || {
                let tree = FreshTree::new();
                tree.put_sequence(0, INSERT_COUNT);
                tree
            },
            |tree| {
                tree.remove_keys(&random_keys);
                black_box(tree.size());
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = LoadedTree::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_get", LOOKUP_SAMPLES), |b| {
        b.iter(|| loaded.point_get(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
    group.bench_function(BenchmarkId::new("range_scan", RANGE_WIDTH), |b| {
        b.iter(|| loaded.range_scan(RANGE_WIDTH));
    });

    group.finish();
}

fn rid(key: i64) -> Rid {
    Rid::new((key % 32) as i16, key)
}

struct FreshTree {
    pager: MemPager,
    tree: MultiValueTree,
}

impl FreshTree {
    fn new() -> Self {
        let pager = MemPager::new(PagerOptions::default()).expect("pager");
        let tree = run_atomic(&pager, |op| {
            MultiValueTree::create(
                op,
                "bench",
                KeyDefinition::scalar(KeyType::Long),
                TreeOptions::default(),
            )
        })
        .expect("tree");
        Self { pager, tree }
    }

    fn size(&self) -> u64 {
        self.tree.size(&self.pager.begin_read()).expect("size")
    }

    fn put_sequence(&self, start: i64, count: i64) {
        run_atomic(&self.pager, |op| {
            for key in start..(start + count) {
                self.tree.put(op, Some(&Key::Long(key)), rid(key))?;
            }
            Ok(())
        })
        .expect("put");
    }

    fn put_keys(&self, keys: &[i64]) {
        run_atomic(&self.pager, |op| {
            for &key in keys {
                self.tree.put(op, Some(&Key::Long(key)), rid(key))?;
            }
            Ok(())
        })
        .expect("put");
    }

    fn put_duplicates(&self, count: i64) {
        run_atomic(&self.pager, |op| {
            for n in 0..count {
                self.tree.put(op, Some(&Key::Long(7)), rid(n))?;
            }
            Ok(())
        })
        .expect("put");
    }

    fn remove_keys(&self, keys: &[i64]) {
        run_atomic(&self.pager, |op| {
            for &key in keys {
                self.tree.remove(op, Some(&Key::Long(key)), rid(key))?;
            }
            Ok(())
        })
        .expect("remove");
    }
}

struct LoadedTree {
    fresh: FreshTree,
    max_key: i64,
    rng: ChaCha8Rng,
}

impl LoadedTree {
    fn new(count: i64) -> Self {
        let fresh = FreshTree::new();
        fresh.put_sequence(0, count);
        Self {
            fresh,
            max_key: count,
            rng: ChaCha8Rng::seed_from_u64(0xFEED_FACE),
        }
    }

    fn point_get(&mut self, samples: usize) {
        let read = self.fresh.pager.begin_read();
        for _ in 0..samples {
            let key = self.rng.gen_range(0..self.max_key);
            black_box(self.fresh.tree.get(&read, Some(&Key::Long(key))).expect("get"));
        }
    }

    fn range_scan(&mut self, width: i64) {
        let read = self.fresh.pager.begin_read();
        for _ in 0..16 {
            let start = self.rng.gen_range(0..(self.max_key - width));
            let cursor = self
                .fresh
                .tree
                .iterate_entries_between(
                    &read,
                    &Key::Long(start),
                    true,
                    &Key::Long(start + width),
                    true,
                    true,
                )
                .expect("range");
            for item in cursor {
                black_box(item.expect("cursor"));
            }
        }
    }
}

criterion_group!(benches, micro_mvbtree);
criterion_main!(benches);
