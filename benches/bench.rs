use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cuckoomap::CuckooMap;

const SIZE: usize = 100_000;

// A deterministic stream of well-spread keys.
#[derive(Clone, Copy)]
struct RandomKeys {
    state: u64,
}

impl RandomKeys {
    fn new() -> Self {
        RandomKeys { state: 0 }
    }
}

impl Iterator for RandomKeys {
    type Item = u64;
    fn next(&mut self) -> Option<u64> {
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state)
    }
}

fn read_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_hit");

    group.bench_function("cuckoomap", |b| {
        let map = CuckooMap::new();
        for k in RandomKeys::new().take(SIZE) {
            map.insert(k, k).unwrap();
        }
        b.iter(|| {
            for k in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(map.get(&k), Some(k)));
            }
        });
    });

    group.bench_function("mutexed_std", |b| {
        let map = Mutex::new(HashMap::new());
        for k in RandomKeys::new().take(SIZE) {
            map.lock().unwrap().insert(k, k);
        }
        b.iter(|| {
            for k in RandomKeys::new().take(SIZE) {
                black_box(assert_eq!(map.lock().unwrap().get(&k), Some(&k)));
            }
        });
    });

    group.finish();
}

fn insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.sample_size(20);

    group.bench_function("cuckoomap", |b| {
        b.iter(|| {
            let map = CuckooMap::new();
            for k in RandomKeys::new().take(SIZE) {
                map.insert(k, k).unwrap();
            }
            black_box(map.len())
        });
    });

    group.bench_function("cuckoomap_preallocated", |b| {
        b.iter(|| {
            let map = CuckooMap::with_capacity(SIZE * 2);
            for k in RandomKeys::new().take(SIZE) {
                map.insert(k, k).unwrap();
            }
            black_box(map.len())
        });
    });

    group.bench_function("mutexed_std", |b| {
        b.iter(|| {
            let map = Mutex::new(HashMap::new());
            for k in RandomKeys::new().take(SIZE) {
                map.lock().unwrap().insert(k, k);
            }
            black_box(map.lock().unwrap().len())
        });
    });

    group.finish();
}

fn concurrent_mixed(c: &mut Criterion) {
    let threads = thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .min(8);

    let mut group = c.benchmark_group("concurrent_mixed");
    group.sample_size(20);

    group.bench_function(format!("cuckoomap_{threads}_threads"), |b| {
        let map = CuckooMap::with_capacity(SIZE * 2);
        for k in RandomKeys::new().take(SIZE) {
            map.insert(k, k).unwrap();
        }
        b.iter(|| {
            thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    s.spawn(move || {
                        // Nine reads to one write.
                        for (i, k) in RandomKeys::new().take(SIZE / threads).enumerate() {
                            if i % 10 == t {
                                map.insert_or_assign(k, k).unwrap();
                            } else {
                                black_box(map.get(&k));
                            }
                        }
                    });
                }
            });
        });
    });

    group.bench_function(format!("mutexed_std_{threads}_threads"), |b| {
        let map = Mutex::new(HashMap::new());
        for k in RandomKeys::new().take(SIZE) {
            map.lock().unwrap().insert(k, k);
        }
        b.iter(|| {
            thread::scope(|s| {
                for t in 0..threads {
                    let map = &map;
                    s.spawn(move || {
                        for (i, k) in RandomKeys::new().take(SIZE / threads).enumerate() {
                            if i % 10 == t {
                                map.lock().unwrap().insert(k, k);
                            } else {
                                black_box(map.lock().unwrap().get(&k).copied());
                            }
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, read_hit, insert, concurrent_mixed);
criterion_main!(benches);
