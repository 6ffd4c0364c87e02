//! Exercises every operation concurrently. Most assertions are about
//! surviving without deadlock or corruption; after the threads quiesce,
//! the stripe counters must agree with an exclusive count of the slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use cuckoomap::CuckooMap;
use rand::prelude::*;

mod common;
use common::{threads, with_map};

#[test]
fn insert_find_disjoint_stress() {
    const ENTRIES: u64 = 1 << 13;

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize);

        thread::scope(|s| {
            for t in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let base = t * ENTRIES;
                    for i in 0..ENTRIES {
                        assert!(map.insert(base + i, i).unwrap());
                    }
                    for i in 0..ENTRIES {
                        assert_eq!(map.get(&(base + i)), Some(i));
                    }
                    for i in 0..ENTRIES {
                        assert!(map.remove(&(base + i)));
                    }
                    for i in 0..ENTRIES {
                        assert_eq!(map.get(&(base + i)), None);
                    }
                });
            }
        });

        assert_eq!(map.len(), 0);
        assert_eq!(map.lock_table().iter().count(), 0);
    });
}

#[test]
fn update_counts_stress() {
    const ENTRIES: u64 = 256;
    const OPERATIONS: u64 = 1 << 8;

    with_map::<u64, u64>(|map| {
        let map = map();
        for i in 0..ENTRIES {
            map.insert(i, 0).unwrap();
        }

        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize);
        thread::scope(|s| {
            for _ in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    let mut order: Vec<u64> = (0..OPERATIONS)
                        .flat_map(|_| 0..ENTRIES)
                        .collect();
                    order.shuffle(&mut rand::thread_rng());
                    barrier.wait();
                    for i in order {
                        assert!(map.update(&i, |v| *v += 1));
                    }
                });
            }
        });

        for i in 0..ENTRIES {
            assert_eq!(map.get(&i), Some(threads * OPERATIONS));
        }
        assert_eq!(map.len() as u64, ENTRIES);
    });
}

#[test]
fn upsert_or_remove_stress() {
    const ENTRIES: u64 = 128;
    const OPERATIONS: u64 = 1 << 9;

    // Every operation adds one to a per-key tally, removing the entry on
    // the way through zero; the sum of all tallies is conserved.
    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize);

        thread::scope(|s| {
            for _ in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for round in 0..OPERATIONS {
                        for i in 0..ENTRIES {
                            // Remove roughly one entry in eight, then
                            // reinstate it so the population recovers.
                            if (round + i) % 8 == 0 {
                                map.remove(&i);
                            }
                            map.upsert(i, |v| *v += 1, 1).unwrap();
                        }
                    }
                });
            }
        });

        // Quiescent: stripe counters agree with an exclusive sweep.
        let len = map.len();
        assert_eq!(map.lock_table().iter().count(), len);
        assert_eq!(len as u64, ENTRIES);
    });
}

#[test]
fn resize_during_writes_stress() {
    const ENTRIES: u64 = 1 << 12;

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads().max(4) as u64;
        let writers = threads - 2;
        let barrier = Barrier::new(threads as usize);

        thread::scope(|s| {
            for t in 0..writers {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let base = t * ENTRIES;
                    for i in 0..ENTRIES {
                        map.insert(base + i, i).unwrap();
                    }
                });
            }

            // One thread repeatedly grows the table explicitly, one
            // bounces it down and up.
            let map_ref = &map;
            let barrier_ref = &barrier;
            s.spawn(move || {
                barrier_ref.wait();
                for _ in 0..4 {
                    let hp = map_ref.hashpower();
                    let _ = map_ref.rehash(hp + 1).unwrap();
                    let _ = map_ref.reserve(1 << 14).unwrap();
                }
            });
            s.spawn(move || {
                barrier_ref.wait();
                for _ in 0..4 {
                    let hp = map_ref.hashpower();
                    let _ = map_ref.rehash(hp.saturating_sub(1).max(1)).unwrap();
                }
            });
        });

        assert_eq!(map.len() as u64, writers * ENTRIES);
        for t in 0..writers {
            for i in 0..ENTRIES {
                assert_eq!(map.get(&(t * ENTRIES + i)), Some(i));
            }
        }
        assert_eq!(map.lock_table().iter().count() as u64, writers * ENTRIES);
    });
}

#[test]
fn locked_iteration_during_writes_stress() {
    const ENTRIES: u64 = 1 << 12;

    let map: CuckooMap<u64, u64> = CuckooMap::new();
    let finished = AtomicBool::new(false);
    let threads = threads().max(3);
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..(threads as u64 - 1) {
            let map = &map;
            let barrier = &barrier;
            let finished = &finished;
            s.spawn(move || {
                barrier.wait();
                let base = t * ENTRIES;
                for i in 0..ENTRIES {
                    map.insert_or_assign(base + i, 1).unwrap();
                }
                finished.store(true, Ordering::Release);
            });
        }

        let map_ref = &map;
        let barrier_ref = &barrier;
        let finished_ref = &finished;
        s.spawn(move || {
            barrier_ref.wait();
            while !finished_ref.load(Ordering::Acquire) {
                let mut locked = map_ref.lock_table();
                let mut count = 0;
                for (_, v) in locked.iter_mut() {
                    *v += 1;
                    count += 1;
                }
                assert_eq!(count, locked.len());
            }
        });
    });

    // Everything written by the inserters is present with some value.
    let locked = map.lock_table();
    for (k, v) in locked.iter() {
        assert!(*k < (threads as u64 - 1) * ENTRIES);
        assert!(*v >= 1);
    }
}

#[test]
fn clear_during_writes_stress() {
    const ENTRIES: u64 = 1 << 12;

    let map: CuckooMap<u64, u64> = CuckooMap::new();
    let threads = threads().max(3);
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for _ in 0..(threads - 1) {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                barrier.wait();
                for _ in 0..ENTRIES {
                    let key: u64 = rng.gen_range(0..ENTRIES);
                    map.insert_or_assign(key, key).unwrap();
                }
            });
        }

        let map_ref = &map;
        let barrier_ref = &barrier;
        s.spawn(move || {
            barrier_ref.wait();
            for _ in 0..16 {
                map_ref.clear();
            }
        });
    });

    // Quiescent consistency: counters match an exclusive sweep, and every
    // surviving entry was written by an inserter.
    let len = map.len();
    let locked = map.lock_table();
    assert_eq!(locked.iter().count(), len);
    for (k, v) in locked.iter() {
        assert_eq!(k, v);
    }
}

#[test]
fn mixed_everything_stress() {
    const KEYSPACE: u64 = 1 << 10;
    const OPERATIONS: u64 = 1 << 12;

    let map: CuckooMap<u64, u64> = CuckooMap::builder().capacity(64).build();
    let threads = threads();
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                barrier.wait();
                for _ in 0..OPERATIONS {
                    let key = rng.gen_range(0..KEYSPACE);
                    match rng.gen_range(0..7u8) {
                        0 => {
                            map.insert(key, key).unwrap();
                        }
                        1 => {
                            map.insert_or_assign(key, key).unwrap();
                        }
                        2 => {
                            map.remove(&key);
                        }
                        3 => {
                            map.update(&key, |v| *v = key);
                        }
                        4 => {
                            map.upsert(key, |v| *v = key, key).unwrap();
                        }
                        5 => {
                            if let Some(v) = map.get(&key) {
                                assert_eq!(v, key);
                            }
                        }
                        _ => {
                            map.contains_key(&key);
                        }
                    }
                }
            });
        }
    });

    let len = map.len();
    let locked = map.lock_table();
    assert_eq!(locked.iter().count(), len);
    for (k, v) in locked.iter() {
        assert_eq!(k, v);
        assert!(*k < KEYSPACE);
    }
}
