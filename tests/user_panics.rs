//! Panics raised from user code (hashers, equality, clone, and the
//! closure-taking operations) must propagate without corrupting the table:
//! every entry stays findable once the faulty code stops panicking, and no
//! locks are left behind.

use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use cuckoomap::CuckooMap;

static HASH_PANICS: AtomicBool = AtomicBool::new(false);
static EQ_PANICS: AtomicBool = AtomicBool::new(false);
static CLONE_PANICS: AtomicBool = AtomicBool::new(false);

// The panic flags are process globals; these tests cannot overlap.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn reset() {
    HASH_PANICS.store(false, Ordering::SeqCst);
    EQ_PANICS.store(false, Ordering::SeqCst);
    CLONE_PANICS.store(false, Ordering::SeqCst);
}

fn panics(outcome: std::thread::Result<impl Sized>) -> bool {
    outcome.is_err()
}

#[derive(Debug, Clone, Copy)]
struct Key(u64);

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        assert!(!HASH_PANICS.load(Ordering::SeqCst), "hash panicked");
        state.write_u64(self.0);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        assert!(!EQ_PANICS.load(Ordering::SeqCst), "eq panicked");
        self.0 == other.0
    }
}

impl Eq for Key {}

#[derive(Debug)]
struct Value(u64);

impl Clone for Value {
    fn clone(&self) -> Value {
        assert!(!CLONE_PANICS.load(Ordering::SeqCst), "clone panicked");
        Value(self.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.0 == other.0
    }
}

// A hasher that passes u64 keys through unchanged, so partial tags of
// small keys are distinct and equality is only consulted on a real match.
#[derive(Clone, Default)]
struct PassThrough;

#[derive(Default)]
struct PassThroughHasher(u64);

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.0
    }
    fn write(&mut self, _bytes: &[u8]) {
        unimplemented!("keys hash via write_u64");
    }
    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

impl BuildHasher for PassThrough {
    type Hasher = PassThroughHasher;
    fn build_hasher(&self) -> PassThroughHasher {
        PassThroughHasher::default()
    }
}

type Table = CuckooMap<Key, Value, PassThrough>;

fn table_with(count: u64) -> Table {
    reset();
    let map = Table::with_hasher(PassThrough);
    for i in 0..count {
        map.insert(Key(i), Value(i)).unwrap();
    }
    map
}

fn assert_intact(map: &Table, expected: u64) {
    reset();
    assert_eq!(map.lock_table().iter().count() as u64, expected);
    assert_eq!(map.len() as u64, expected);
    for i in 0..expected {
        assert_eq!(map.get(&Key(i)), Some(Value(i)));
    }
}

#[test]
fn get_and_contains() {
    let _serial = serial();
    let map = table_with(3);

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.get(&Key(2))))));
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.contains_key(&Key(2))
    }))));
    HASH_PANICS.store(false, Ordering::SeqCst);

    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.get(&Key(2))))));
    EQ_PANICS.store(false, Ordering::SeqCst);

    CLONE_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.get(&Key(2))))));
    CLONE_PANICS.store(false, Ordering::SeqCst);

    assert_eq!(map.get(&Key(2)), Some(Value(2)));
    assert!(map.contains_key(&Key(2)));
    assert_intact(&map, 3);
}

#[test]
fn insert() {
    let _serial = serial();
    let map = table_with(0);

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.insert(Key(100), Value(100))
    }))));
    HASH_PANICS.store(false, Ordering::SeqCst);

    assert!(map.insert(Key(100), Value(100)).unwrap());
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&Key(100)), Some(Value(100)));
}

#[test]
fn remove() {
    let _serial = serial();
    let map = table_with(10);

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.remove(&Key(5))))));
    HASH_PANICS.store(false, Ordering::SeqCst);

    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.remove(&Key(5))))));
    EQ_PANICS.store(false, Ordering::SeqCst);

    assert!(map.remove(&Key(5)));
    reset();
    assert_eq!(map.lock_table().iter().count(), 9);
}

#[test]
fn assign_and_update() {
    let _serial = serial();
    let map = table_with(2);

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.assign(&Key(0), Value(9))
    }))));
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.update(&Key(0), |v| v.0 += 1)
    }))));
    HASH_PANICS.store(false, Ordering::SeqCst);

    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.assign(&Key(0), Value(9))
    }))));
    EQ_PANICS.store(false, Ordering::SeqCst);

    assert!(map.assign(&Key(0), Value(9)));
    assert_eq!(map.get(&Key(0)), Some(Value(9)));
    assert!(map.update(&Key(0), |v| v.0 = 0));
    assert_intact(&map, 2);
}

#[test]
fn upsert() {
    let _serial = serial();
    let map = table_with(1);

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.upsert(Key(0), |v| v.0 += 1, Value(10))
    }))));
    HASH_PANICS.store(false, Ordering::SeqCst);

    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.upsert(Key(0), |v| v.0 += 1, Value(10))
    }))));
    EQ_PANICS.store(false, Ordering::SeqCst);

    assert!(!map.upsert(Key(0), |v| v.0 = 0, Value(10)).unwrap());
    assert!(map.upsert(Key(1), |v| v.0 += 1, Value(1)).unwrap());
    assert_intact(&map, 2);
}

#[test]
fn mutator_panic_releases_locks() {
    let _serial = serial();
    let map = table_with(4);

    // A panicking update closure must not leave the stripes locked.
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.update(&Key(1), |_| panic!("mutator failed"))
    }))));
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.upsert(Key(2), |_| panic!("mutator failed"), Value(0))
    }))));
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.remove_if(&Key(3), |_| panic!("mutator failed"))
    }))));

    // The same entries are still reachable and writable.
    assert!(map.update(&Key(1), |v| v.0 = 1));
    assert!(map.update(&Key(2), |v| v.0 = 2));
    assert!(map.update(&Key(3), |v| v.0 = 3));
    assert_intact(&map, 4);
}

#[test]
fn rehash() {
    let _serial = serial();
    let map = table_with(10);
    let original = map.hashpower();

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| {
        map.rehash(original + 1)
    }))));
    HASH_PANICS.store(false, Ordering::SeqCst);
    assert_eq!(map.hashpower(), original);
    assert_intact(&map, 10);

    // Rehashing never compares keys for equality: the pass-through hash
    // gives every key a distinct partial, so a panicking Eq is never
    // consulted.
    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(map.rehash(original + 1).unwrap());
    EQ_PANICS.store(false, Ordering::SeqCst);
    assert_eq!(map.hashpower(), original + 1);
    assert_intact(&map, 10);
}

#[test]
fn reserve() {
    let _serial = serial();
    let map = table_with(10);
    let original = map.hashpower();
    let target = map.capacity() * 2;

    HASH_PANICS.store(true, Ordering::SeqCst);
    assert!(panics(catch_unwind(AssertUnwindSafe(|| map.reserve(target)))));
    HASH_PANICS.store(false, Ordering::SeqCst);
    assert_eq!(map.hashpower(), original);

    EQ_PANICS.store(true, Ordering::SeqCst);
    assert!(map.reserve(target).unwrap());
    EQ_PANICS.store(false, Ordering::SeqCst);
    assert_eq!(map.hashpower(), original + 1);
    assert_intact(&map, 10);
}
