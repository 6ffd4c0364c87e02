//! The table core.
//!
//! Buckets are protected by a striped array of seqlocks: bucket `b` maps to
//! stripe `b & (MAX_STRIPES - 1)`. Writers take the stripes covering a
//! key's two candidate buckets in stripe order; readers run optimistically,
//! snapshotting candidate slots by bytes and validating both stripe epochs
//! before any user `Eq`/`Clone` code touches the snapshot.
//!
//! A doubling appends a segment to the bucket array in place. Tables with
//! at least [`MAX_STRIPES`] buckets migrate lazily: each stripe is marked
//! unmigrated and reclassified by the first operation that locks it. The
//! full-rebuild path (shrinks and explicit rehashes) builds a fresh table
//! and swaps the arrays in; replaced arrays are retired, not freed, so a
//! straggling optimistic reader can still dereference them and then fail
//! validation.

mod alloc;
mod bucket;
mod parallel;
mod probe;
mod seqlock;
mod utils;

pub(crate) use bucket::SLOT_PER_BUCKET;
pub(crate) use probe::reserve_calc;

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{self, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use parking_lot_core::SpinWait;

use self::alloc::{BucketArray, StripeArray};
use self::bucket::Bucket;
use self::probe::{alt_index, hashsize, index_hash, partial_key, HashValue};
use self::seqlock::SeqLock;
use crate::trace::{debug_log, trace_log};
use crate::Error;

/// The stripe count is capped at `2^16`; beyond that, buckets share.
pub(crate) const MAX_STRIPES_POW: usize = 16;
pub(crate) const MAX_STRIPES: usize = 1 << MAX_STRIPES_POW;

/// Automatic expansions below this load factor fail instead of doubling.
pub(crate) const DEFAULT_MIN_LOAD_FACTOR: f64 = 0.05;

// The maximum number of slot moves in a cuckoo path.
const MAX_BFS_PATH_LEN: usize = 5;

// Just enough queue entries for a full-depth search from two starting
// buckets: 2 * sum_{k=0}^{L-1} S^k.
const MAX_CUCKOO_COUNT: usize =
    2 * ((SLOT_PER_BUCKET.pow(MAX_BFS_PATH_LEN as u32) - 1) / (SLOT_PER_BUCKET - 1));

const NO_MAX_HASHPOWER: usize = usize::MAX;

#[inline]
fn lock_ind(index: usize) -> usize {
    index & (MAX_STRIPES - 1)
}

/// A bucket-and-slot coordinate.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TablePosition {
    pub index: usize,
    pub slot: usize,
}

// Internal retry signal: the hashpower (or the stripe array itself)
// changed while we were acquiring locks. Never escapes to users.
struct HashpowerChanged;

enum InsertStatus {
    Open(TablePosition),
    Duplicate(TablePosition),
    TableFull,
    UnderExpansion,
}

pub(crate) enum Insertion {
    Open(TablePosition),
    Duplicate(TablePosition),
}

enum CuckooResult {
    Ok(TablePosition),
    Full,
    UnderExpansion,
}

/// Guard over the stripes covering a key's two candidate buckets.
///
/// Dropping releases with an epoch bump; paths that modified nothing call
/// [`TwoBuckets::unlock_clean`] so overlapping readers are not disturbed.
/// In locked-table mode the guard carries no locks at all.
pub(crate) struct TwoBuckets<'a> {
    pub i1: usize,
    pub i2: usize,
    locks: Option<(&'a SeqLock, Option<&'a SeqLock>)>,
}

impl<'a> TwoBuckets<'a> {
    fn unlocked(i1: usize, i2: usize) -> TwoBuckets<'a> {
        TwoBuckets { i1, i2, locks: None }
    }

    fn first_lock(&self) -> Option<&'a SeqLock> {
        self.locks.as_ref().map(|&(first, _)| first)
    }

    fn release(&mut self) {
        if let Some((first, second)) = self.locks.take() {
            first.unlock();
            if let Some(second) = second {
                second.unlock();
            }
        }
    }

    pub(crate) fn unlock_clean(mut self) {
        if let Some((first, second)) = self.locks.take() {
            first.unlock_clean();
            if let Some(second) = second {
                second.unlock_clean();
            }
        }
    }
}

impl Drop for TwoBuckets<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// A single locked stripe, released with a bump on drop.
struct OneBucket<'a> {
    lock: Option<&'a SeqLock>,
}

impl Drop for OneBucket<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.unlock();
        }
    }
}

// Guards either every stripe of a table, or nothing in locked-table mode.
// The drop re-resolves the current stripe array: a rebuild that ran under
// this guard swapped the arrays, and it is the new stripes we hold.
pub(crate) struct AllLocks<'a, K, V, S> {
    table: Option<&'a RawTable<K, V, S>>,
}

impl<K, V, S> Drop for AllLocks<'_, K, V, S> {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            let stripes = table.stripes();
            for l in 0..stripes.len() {
                stripes.stripe(l).unlock();
            }
        }
    }
}

// One step of a cuckoo path. Only hashes are recorded: replay validates by
// hash equality, since equal-hash keys trace identical paths.
#[derive(Clone, Copy, Default)]
struct CuckooRecord {
    bucket: usize,
    slot: usize,
    hash: u64,
    partial: u8,
}

// A BFS frontier entry: the bucket it reached, the slots walked to get
// there packed base-SLOT_PER_BUCKET, and the path length so far.
#[derive(Clone, Copy, Default)]
struct BSlot {
    bucket: usize,
    pathcode: u16,
    depth: u8,
}

struct BQueue {
    slots: [BSlot; MAX_CUCKOO_COUNT],
    first: usize,
    last: usize,
}

impl BQueue {
    fn new() -> BQueue {
        BQueue {
            slots: [BSlot::default(); MAX_CUCKOO_COUNT],
            first: 0,
            last: 0,
        }
    }

    fn enqueue(&mut self, x: BSlot) {
        // Statically sized for a full two-root search; cannot overflow.
        debug_assert!(self.last < MAX_CUCKOO_COUNT);
        self.slots[self.last] = x;
        self.last += 1;
    }

    fn dequeue(&mut self) -> Option<BSlot> {
        if self.first == self.last {
            return None;
        }
        let x = self.slots[self.first];
        self.first += 1;
        Some(x)
    }
}

// Byte snapshots of the candidate slots an optimistic reader may need.
// Never dropped with contents: the pairs are shallow copies of storage the
// table still owns.
struct SlotSnaps<K, V> {
    len: usize,
    pairs: [MaybeUninit<(K, V)>; 2 * SLOT_PER_BUCKET],
}

impl<K, V> SlotSnaps<K, V> {
    fn new() -> SlotSnaps<K, V> {
        SlotSnaps {
            len: 0,
            // Safety: an array of MaybeUninit is trivially initialized.
            pairs: unsafe { MaybeUninit::uninit().assume_init() },
        }
    }

    // Byte-copies every occupied slot whose partial matches. The copies
    // may be torn; they are discarded unless epoch validation succeeds.
    fn collect(&mut self, bucket: &Bucket<K, V>, partial: u8) {
        for slot in 0..SLOT_PER_BUCKET {
            if bucket.occupied(slot) && bucket.partial(slot) == partial {
                self.pairs[self.len] = unsafe { ptr::read_volatile(bucket.pair_ptr(slot)) };
                self.len += 1;
            }
        }
    }

    // # Safety
    //
    // Only call after epoch validation proved the snapshot consistent.
    unsafe fn search<Q, T>(&self, key: &Q, read: impl FnOnce(&V) -> T) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for i in 0..self.len {
            let (k, v) = &*self.pairs[i].as_ptr();
            if k.borrow() == key {
                return Some(read(v));
            }
        }
        None
    }
}

fn need_to_move(hv: HashValue, old_hashpower: usize, old_index: usize) -> bool {
    let new_hashpower = old_hashpower + 1;
    let new_index = old_index + hashsize(old_hashpower);
    let old_primary = index_hash(old_hashpower, hv.hash);
    let old_alt = alt_index(old_hashpower, hv.partial, old_primary);
    let new_primary = index_hash(new_hashpower, hv.hash);
    let new_alt = alt_index(new_hashpower, hv.partial, new_primary);
    (old_index == old_primary && new_primary == new_index)
        || (old_index == old_alt && new_alt == new_index)
}

struct Retired<K, V> {
    buckets: Vec<Box<BucketArray<K, V>>>,
    stripes: Vec<Box<StripeArray>>,
}

/// The concurrent cuckoo table, minus any public-facing ergonomics.
pub(crate) struct RawTable<K, V, S> {
    buckets: AtomicPtr<BucketArray<K, V>>,
    stripes: AtomicPtr<StripeArray>,
    // Arrays replaced by a rebuild, kept alive for straggling readers.
    retired: Mutex<Retired<K, V>>,
    hash_builder: S,
    // Policy knobs, atomically mutable (f64 stored as bits).
    min_load_factor: AtomicU64,
    max_hashpower: AtomicUsize,
    worker_threads: AtomicUsize,
}

// Safety: the table owns its keys and values and hands out references only
// under the locking protocol; it is a container in the usual sense.
unsafe impl<K: Send, V: Send, S: Send> Send for RawTable<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for RawTable<K, V, S> {}

impl<K, V, S> RawTable<K, V, S> {
    pub(crate) fn with_hashpower(hashpower: usize, hash_builder: S) -> RawTable<K, V, S> {
        let stripe_count = hashsize(hashpower).min(MAX_STRIPES);
        RawTable {
            buckets: AtomicPtr::new(Box::into_raw(BucketArray::new(hashpower))),
            stripes: AtomicPtr::new(Box::into_raw(StripeArray::new(stripe_count, false, true))),
            retired: Mutex::new(Retired {
                buckets: Vec::new(),
                stripes: Vec::new(),
            }),
            hash_builder,
            min_load_factor: AtomicU64::new(DEFAULT_MIN_LOAD_FACTOR.to_bits()),
            max_hashpower: AtomicUsize::new(NO_MAX_HASHPOWER),
            worker_threads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_capacity(capacity: usize, hash_builder: S) -> RawTable<K, V, S> {
        RawTable::with_hashpower(reserve_calc(capacity), hash_builder)
    }

    #[inline]
    fn buckets(&self) -> &BucketArray<K, V> {
        // Safety: the current array is live, and replaced arrays are
        // retired rather than freed, so the borrow outlives any swap.
        unsafe { &*self.buckets.load(Ordering::Acquire) }
    }

    #[inline]
    fn stripes(&self) -> &StripeArray {
        // Safety: as for `buckets`.
        unsafe { &*self.stripes.load(Ordering::Acquire) }
    }

    #[inline]
    pub(crate) fn hashpower(&self) -> usize {
        self.buckets().hashpower()
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets().len()
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.bucket_count() * SLOT_PER_BUCKET
    }

    pub(crate) fn size(&self) -> usize {
        let stripes = self.stripes();
        let mut total: i64 = 0;
        for l in 0..stripes.len() {
            total += stripes.stripe(l).counter();
        }
        total.max(0) as usize
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    pub(crate) fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    pub(crate) fn min_load_factor(&self) -> f64 {
        f64::from_bits(self.min_load_factor.load(Ordering::Acquire))
    }

    pub(crate) fn set_min_load_factor(&self, mlf: f64) {
        assert!(
            (0.0..=1.0).contains(&mlf),
            "load factor {mlf} must be between 0 and 1"
        );
        self.min_load_factor.store(mlf.to_bits(), Ordering::Release);
    }

    pub(crate) fn max_hashpower(&self) -> Option<usize> {
        match self.max_hashpower.load(Ordering::Acquire) {
            NO_MAX_HASHPOWER => None,
            max => Some(max),
        }
    }

    pub(crate) fn set_max_hashpower(&self, max: Option<usize>) {
        if let Some(max) = max {
            assert!(
                max >= self.hashpower(),
                "maximum hashpower {max} is below the current hashpower"
            );
        }
        self.max_hashpower
            .store(max.unwrap_or(NO_MAX_HASHPOWER), Ordering::Release);
    }

    pub(crate) fn worker_threads(&self) -> usize {
        self.worker_threads.load(Ordering::Acquire)
    }

    pub(crate) fn set_worker_threads(&self, threads: usize) {
        self.worker_threads.store(threads, Ordering::Release);
    }
}

impl<K, V, S> RawTable<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    #[inline]
    fn hashed_key<Q: Hash + ?Sized>(&self, key: &Q) -> HashValue {
        let hash = self.hash_only(key);
        HashValue {
            hash,
            partial: partial_key(hash),
        }
    }

    #[inline]
    fn hash_only<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    // ---- locking ----

    // Locks stripe `l` in the current stripe array and completes its
    // migration if the last doubling left it behind. Fails if a rebuild
    // swapped the array before the lock landed: a retired stripe no
    // longer protects anything.
    fn lock_and_migrate(&self, l: usize) -> Result<&SeqLock, HashpowerChanged> {
        let stripes_ptr = self.stripes.load(Ordering::Acquire);
        // Safety: current or retired, the array is live.
        let stripes = unsafe { &*stripes_ptr };
        if l >= stripes.len() {
            return Err(HashpowerChanged);
        }
        let lock = stripes.stripe(l);
        let word = lock.lock();
        if self.stripes.load(Ordering::Acquire) != stripes_ptr {
            lock.unlock_clean();
            return Err(HashpowerChanged);
        }
        if !SeqLock::is_migrated(word) {
            self.migrate_and_mark(lock, l);
        }
        Ok(lock)
    }

    // Runs the stripe migration with an unwind guard: a panicking user
    // hasher leaves the stripe unmigrated but unlocked, and the migration
    // is per-item restartable.
    fn migrate_and_mark(&self, lock: &SeqLock, l: usize) {
        struct UnlockOnPanic<'a>(&'a SeqLock);
        impl Drop for UnlockOnPanic<'_> {
            fn drop(&mut self) {
                self.0.unlock();
            }
        }
        let guard = UnlockOnPanic(lock);
        self.migrate_stripe(l);
        mem::forget(guard);
        lock.set_migrated(true);
    }

    fn lock_one<const LOCKED: bool>(
        &self,
        hashpower: usize,
        i: usize,
    ) -> Result<OneBucket<'_>, HashpowerChanged> {
        if LOCKED {
            return Ok(OneBucket { lock: None });
        }
        let lock = self.lock_and_migrate(lock_ind(i))?;
        if self.hashpower() != hashpower {
            lock.unlock();
            return Err(HashpowerChanged);
        }
        Ok(OneBucket { lock: Some(lock) })
    }

    // Locks the stripes of both candidate buckets in stripe order.
    fn lock_two<const LOCKED: bool>(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
    ) -> Result<TwoBuckets<'_>, HashpowerChanged> {
        if LOCKED {
            return Ok(TwoBuckets::unlocked(i1, i2));
        }
        let (la, lb) = {
            let (l1, l2) = (lock_ind(i1), lock_ind(i2));
            (l1.min(l2), l1.max(l2))
        };
        let first = self.lock_and_migrate(la)?;
        if self.hashpower() != hashpower {
            first.unlock();
            return Err(HashpowerChanged);
        }
        let second = if la != lb {
            match self.lock_and_migrate(lb) {
                Ok(lock) => Some(lock),
                Err(changed) => {
                    first.unlock();
                    return Err(changed);
                }
            }
        } else {
            None
        };
        Ok(TwoBuckets {
            i1,
            i2,
            locks: Some((first, second)),
        })
    }

    // Locks three buckets' stripes in stripe order, returning the caller's
    // candidate pair plus the extra stripe (inert when it aliases).
    fn lock_three<const LOCKED: bool>(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
        i3: usize,
    ) -> Result<(TwoBuckets<'_>, OneBucket<'_>), HashpowerChanged> {
        if LOCKED {
            return Ok((TwoBuckets::unlocked(i1, i2), OneBucket { lock: None }));
        }
        let (s1, s2, s3) = (lock_ind(i1), lock_ind(i2), lock_ind(i3));
        let mut order = [s1, s2, s3];
        order.sort_unstable();

        let mut held: [Option<&SeqLock>; 3] = [None; 3];
        for idx in 0..3 {
            if idx > 0 && order[idx] == order[idx - 1] {
                continue;
            }
            match self.lock_and_migrate(order[idx]) {
                Ok(lock) => {
                    if idx == 0 && self.hashpower() != hashpower {
                        lock.unlock();
                        return Err(HashpowerChanged);
                    }
                    held[idx] = Some(lock);
                }
                Err(changed) => {
                    for lock in held.iter().flatten() {
                        lock.unlock();
                    }
                    return Err(changed);
                }
            }
        }

        fn lock_for<'a>(
            order: &[usize; 3],
            held: &[Option<&'a SeqLock>; 3],
            stripe: usize,
        ) -> &'a SeqLock {
            for (idx, &o) in order.iter().enumerate() {
                if o == stripe {
                    if let Some(lock) = held[idx] {
                        return lock;
                    }
                }
            }
            unreachable!("stripe {stripe} was not locked");
        }

        let locks = if s1 == s2 {
            (lock_for(&order, &held, s1), None)
        } else {
            (
                lock_for(&order, &held, s1.min(s2)),
                Some(lock_for(&order, &held, s1.max(s2))),
            )
        };
        let third = if s3 != s1 && s3 != s2 {
            Some(lock_for(&order, &held, s3))
        } else {
            None
        };
        Ok((
            TwoBuckets {
                i1,
                i2,
                locks: Some(locks),
            },
            OneBucket { lock: third },
        ))
    }

    // Resolves the candidate buckets under the current hashpower and locks
    // them, retrying until the hashpower holds still across the acquire.
    fn snapshot_and_lock_two<const LOCKED: bool>(&self, hv: HashValue) -> TwoBuckets<'_> {
        loop {
            let hashpower = self.hashpower();
            let i1 = index_hash(hashpower, hv.hash);
            let i2 = alt_index(hashpower, hv.partial, i1);
            match self.lock_two::<LOCKED>(hashpower, i1, i2) {
                Ok(b) => return b,
                Err(HashpowerChanged) => continue,
            }
        }
    }

    // Takes every stripe in index order. Does not migrate and does not
    // check the hashpower; resize paths recheck under the guard.
    pub(crate) fn lock_all<const LOCKED: bool>(&self) -> AllLocks<'_, K, V, S> {
        if LOCKED {
            return AllLocks { table: None };
        }
        loop {
            let stripes_ptr = self.stripes.load(Ordering::Acquire);
            // Safety: live (current or retired).
            let stripes = unsafe { &*stripes_ptr };
            let mut l = 0;
            // The count can grow underneath us (an earlier holder may
            // double the stripes before releasing); re-read it each step.
            while l < stripes.len() {
                stripes.stripe(l).lock();
                l += 1;
            }
            if self.stripes.load(Ordering::Acquire) == stripes_ptr {
                return AllLocks { table: Some(self) };
            }
            // A rebuild swapped the array out from under the sweep.
            for i in 0..l {
                stripes.stripe(i).unlock();
            }
        }
    }

    // ---- optimistic reads ----

    // Reads the stripe word for validation; locks and migrates first if
    // the stripe was left behind by a doubling. `None` means retry.
    fn read_and_migrate<'a>(
        &'a self,
        stripes_ptr: *mut StripeArray,
        l: usize,
    ) -> Option<(&'a SeqLock, u64)> {
        // Safety: live (current or retired).
        let stripes = unsafe { &*stripes_ptr };
        if l >= stripes.len() {
            return None;
        }
        let lock = stripes.stripe(l);
        let epoch = lock.read_epoch();
        if SeqLock::is_locked(epoch) {
            return None;
        }
        if !SeqLock::is_migrated(epoch) {
            let word = lock.lock();
            if self.stripes.load(Ordering::Acquire) != stripes_ptr {
                // The stripe was retired while we acquired it.
                lock.unlock_clean();
                return None;
            }
            if !SeqLock::is_migrated(word) {
                trace_log!(stripe = l, "migrating stripe on read");
                self.migrate_and_mark(lock, l);
            }
            lock.unlock();
            return None;
        }
        Some((lock, epoch))
    }

    /// Optimistic lookup. `read` runs on a validated private snapshot of
    /// the pair and is invoked at most once.
    pub(crate) fn read_value<Q, T>(&self, key: &Q, read: impl Fn(&V) -> T) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed_key(key);
        let mut spin = SpinWait::new();
        loop {
            let buckets_ptr = self.buckets.load(Ordering::Acquire);
            let stripes_ptr = self.stripes.load(Ordering::Acquire);
            // Safety: live (current or retired); indices below are
            // computed against this array's own hashpower.
            let buckets = unsafe { &*buckets_ptr };
            let hashpower = buckets.hashpower();
            let i1 = index_hash(hashpower, hv.hash);
            let i2 = alt_index(hashpower, hv.partial, i1);
            let (l1, l2) = (lock_ind(i1), lock_ind(i2));

            let Some((lock1, epoch1)) = self.read_and_migrate(stripes_ptr, l1) else {
                spin.spin_no_yield();
                continue;
            };
            if self.hashpower() != hashpower {
                continue;
            }
            let (lock2, epoch2) = if l1 != l2 {
                match self.read_and_migrate(stripes_ptr, l2) {
                    Some(snapshot) => snapshot,
                    None => {
                        spin.spin_no_yield();
                        continue;
                    }
                }
            } else {
                (lock1, epoch1)
            };

            let mut snaps = SlotSnaps::new();
            snaps.collect(buckets.bucket(i1), hv.partial);
            snaps.collect(buckets.bucket(i2), hv.partial);

            // Order the snapshot loads before the validating epoch loads.
            atomic::fence(Ordering::Acquire);

            if epoch1 == lock1.read_epoch()
                && (l1 == l2 || epoch2 == lock2.read_epoch())
                && self.buckets.load(Ordering::Acquire) == buckets_ptr
                && self.stripes.load(Ordering::Acquire) == stripes_ptr
            {
                // Safety: no writer committed against either stripe while
                // we copied, so the snapshot is consistent.
                return unsafe { snaps.search(key, &read) };
            }
            spin.spin_no_yield();
        }
    }

    // ---- locked search ----

    // Scans both candidate buckets under held locks.
    fn cuckoo_find<Q>(&self, key: &Q, partial: u8, i1: usize, i2: usize) -> Option<TablePosition>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let buckets = self.buckets();
        for index in [i1, i2] {
            let bucket = buckets.bucket(index);
            for slot in 0..SLOT_PER_BUCKET {
                if !bucket.occupied(slot) || bucket.partial(slot) != partial {
                    continue;
                }
                // Safety: the covering stripe is held.
                if unsafe { bucket.key(slot) }.borrow() == key {
                    return Some(TablePosition { index, slot });
                }
            }
        }
        None
    }

    // Scans one bucket for a duplicate of `key` and for an open slot.
    // `Err(slot)` is a duplicate; `Ok` carries the first open slot.
    fn find_insert_slot(
        &self,
        bucket: &Bucket<K, V>,
        partial: u8,
        key: &K,
    ) -> Result<Option<usize>, usize> {
        let mut open = None;
        for slot in 0..SLOT_PER_BUCKET {
            if bucket.occupied(slot) {
                if bucket.partial(slot) != partial {
                    continue;
                }
                // Safety: the covering stripe is held.
                if unsafe { bucket.key(slot) } == key {
                    return Err(slot);
                }
            } else if open.is_none() {
                open = Some(slot);
            }
        }
        Ok(open)
    }

    // ---- insertion ----

    // Finds a slot for `key`, cuckooing if both candidates are full. On
    // `Open`/`Duplicate` the candidate stripes are held; on
    // `TableFull`/`UnderExpansion` everything is released.
    fn cuckoo_insert<'a, const LOCKED: bool>(
        &'a self,
        hv: HashValue,
        b: &mut TwoBuckets<'a>,
        key: &K,
    ) -> InsertStatus {
        let buckets = self.buckets();
        let open1 = match self.find_insert_slot(buckets.bucket(b.i1), hv.partial, key) {
            Err(slot) => {
                return InsertStatus::Duplicate(TablePosition { index: b.i1, slot });
            }
            Ok(open) => open,
        };
        let open2 = match self.find_insert_slot(buckets.bucket(b.i2), hv.partial, key) {
            Err(slot) => {
                return InsertStatus::Duplicate(TablePosition { index: b.i2, slot });
            }
            Ok(open) => open,
        };
        if let Some(slot) = open1 {
            return InsertStatus::Open(TablePosition { index: b.i1, slot });
        }
        if let Some(slot) = open2 {
            return InsertStatus::Open(TablePosition { index: b.i2, slot });
        }

        // Both candidates are full: free a slot by walking a cuckoo path.
        match self.run_cuckoo::<LOCKED>(b) {
            CuckooResult::UnderExpansion => InsertStatus::UnderExpansion,
            CuckooResult::Full => {
                debug_log!(
                    hashpower = self.hashpower(),
                    "no cuckoo path found, table needs to grow"
                );
                InsertStatus::TableFull
            }
            CuckooResult::Ok(pos) => {
                debug_assert!(!self.buckets().bucket(pos.index).occupied(pos.slot));
                // The stripes were released during the search; the same
                // key may have been inserted behind our back.
                if let Some(dup) = self.cuckoo_find(key, hv.partial, b.i1, b.i2) {
                    return InsertStatus::Duplicate(dup);
                }
                InsertStatus::Open(pos)
            }
        }
    }

    // Repeatedly searches for a cuckoo path and replays it. Must release
    // the caller's stripes first: the search locks arbitrary stripes and
    // holding two fixed ones would deadlock against other inserters. On
    // success the caller's stripes are re-held (by the final three-lock).
    fn run_cuckoo<'a, const LOCKED: bool>(&'a self, b: &mut TwoBuckets<'a>) -> CuckooResult {
        let hashpower = self.hashpower();
        b.release();
        let mut path = [CuckooRecord::default(); MAX_BFS_PATH_LEN];
        loop {
            let depth = match self.cuckoopath_search::<LOCKED>(hashpower, &mut path, b.i1, b.i2) {
                Err(HashpowerChanged) => return CuckooResult::UnderExpansion,
                Ok(None) => return CuckooResult::Full,
                Ok(Some(depth)) => depth,
            };
            match self.cuckoopath_move::<LOCKED>(hashpower, &path, depth, b) {
                Err(HashpowerChanged) => return CuckooResult::UnderExpansion,
                Ok(true) => {
                    let pos = TablePosition {
                        index: path[0].bucket,
                        slot: path[0].slot,
                    };
                    debug_assert!(pos.index == b.i1 || pos.index == b.i2);
                    return CuckooResult::Ok(pos);
                }
                Ok(false) => continue,
            }
        }
    }

    // BFS over the bucket graph for a path to an open slot, locking one
    // stripe at a time.
    fn slot_search<const LOCKED: bool>(
        &self,
        hashpower: usize,
        i1: usize,
        i2: usize,
    ) -> Result<Option<BSlot>, HashpowerChanged> {
        let mut queue = BQueue::new();
        // The initial pathcode records which candidate the path starts on.
        queue.enqueue(BSlot {
            bucket: i1,
            pathcode: 0,
            depth: 0,
        });
        queue.enqueue(BSlot {
            bucket: i2,
            pathcode: 1,
            depth: 0,
        });
        while let Some(mut x) = queue.dequeue() {
            let guard = self.lock_one::<LOCKED>(hashpower, x.bucket)?;
            let bucket = self.buckets().bucket(x.bucket);
            // Start from a pseudorandom slot so paths spread out.
            let start = x.pathcode as usize % SLOT_PER_BUCKET;
            for i in 0..SLOT_PER_BUCKET {
                let slot = (start + i) % SLOT_PER_BUCKET;
                if !bucket.occupied(slot) {
                    x.pathcode = x.pathcode * SLOT_PER_BUCKET as u16 + slot as u16;
                    return Ok(Some(x));
                }
                if (x.depth as usize) < MAX_BFS_PATH_LEN - 1 {
                    queue.enqueue(BSlot {
                        bucket: alt_index(hashpower, bucket.partial(slot), x.bucket),
                        pathcode: x.pathcode * SLOT_PER_BUCKET as u16 + slot as u16,
                        depth: x.depth + 1,
                    });
                }
            }
            drop(guard);
        }
        trace_log!("cuckoo path search exhausted the queue");
        Ok(None)
    }

    // Turns a BFS result into a concrete path, recording each occupant's
    // hash. Runs unlocked between hops, so the path may be stale; replay
    // revalidates every step.
    fn cuckoopath_search<const LOCKED: bool>(
        &self,
        hashpower: usize,
        path: &mut [CuckooRecord; MAX_BFS_PATH_LEN],
        i1: usize,
        i2: usize,
    ) -> Result<Option<usize>, HashpowerChanged> {
        let mut x = match self.slot_search::<LOCKED>(hashpower, i1, i2)? {
            None => return Ok(None),
            Some(x) => x,
        };
        // Unpack the slot sequence from the end of the code backwards.
        for i in (0..=x.depth as usize).rev() {
            path[i].slot = x.pathcode as usize % SLOT_PER_BUCKET;
            x.pathcode /= SLOT_PER_BUCKET as u16;
        }
        path[0].bucket = if x.pathcode == 0 {
            i1
        } else {
            debug_assert_eq!(x.pathcode, 1);
            i2
        };
        {
            let _guard = self.lock_one::<LOCKED>(hashpower, path[0].bucket)?;
            let bucket = self.buckets().bucket(path[0].bucket);
            if !bucket.occupied(path[0].slot) {
                // The slot emptied since the search; shortcut.
                return Ok(Some(0));
            }
            // Safety: stripe held by `_guard`.
            let hv = self.hashed_key(unsafe { bucket.key(path[0].slot) });
            path[0].hash = hv.hash;
            path[0].partial = hv.partial;
        }
        for i in 1..=x.depth as usize {
            let (prev_bucket, prev_partial) = (path[i - 1].bucket, path[i - 1].partial);
            path[i].bucket = alt_index(hashpower, prev_partial, prev_bucket);
            let _guard = self.lock_one::<LOCKED>(hashpower, path[i].bucket)?;
            let bucket = self.buckets().bucket(path[i].bucket);
            if !bucket.occupied(path[i].slot) {
                return Ok(Some(i));
            }
            // Safety: stripe held by `_guard`.
            let hv = self.hashed_key(unsafe { bucket.key(path[i].slot) });
            path[i].hash = hv.hash;
            path[i].partial = hv.partial;
        }
        Ok(Some(x.depth as usize))
    }

    // Replays a path from the far end toward the candidates, revalidating
    // each hop. The final hop takes three stripes and, on success, leaves
    // the caller's two held.
    fn cuckoopath_move<'a, const LOCKED: bool>(
        &'a self,
        hashpower: usize,
        path: &[CuckooRecord; MAX_BFS_PATH_LEN],
        depth: usize,
        b: &mut TwoBuckets<'a>,
    ) -> Result<bool, HashpowerChanged> {
        if depth == 0 {
            // The search found an open slot directly in a candidate
            // bucket; just confirm it is still open under the locks.
            let pos = path[0];
            debug_assert!(pos.bucket == b.i1 || pos.bucket == b.i2);
            let two = self.lock_two::<LOCKED>(hashpower, b.i1, b.i2)?;
            if !self.buckets().bucket(pos.bucket).occupied(pos.slot) {
                *b = two;
                return Ok(true);
            }
            return Ok(false);
        }

        enum Hold<'a> {
            Final(TwoBuckets<'a>, OneBucket<'a>),
            Hop(TwoBuckets<'a>),
        }

        let mut depth = depth;
        while depth > 0 {
            let from = path[depth - 1];
            let to = path[depth];
            let hold = if depth == 1 {
                let (two, extra) = self.lock_three::<LOCKED>(hashpower, b.i1, b.i2, to.bucket)?;
                Hold::Final(two, extra)
            } else {
                Hold::Hop(self.lock_two::<LOCKED>(hashpower, from.bucket, to.bucket)?)
            };

            let buckets = self.buckets();
            let from_bucket = buckets.bucket(from.bucket);
            let to_bucket = buckets.bucket(to.bucket);

            // The occupant may have been scooped by a racing cuckoo, the
            // destination may have filled, or the source emptied. Hash
            // equality is the validity criterion: equal-hash keys trace
            // the same path, so the move stays correct.
            if to_bucket.occupied(to.slot)
                || !from_bucket.occupied(from.slot)
                || self.hash_only(unsafe { from_bucket.key(from.slot) }) != from.hash
            {
                return Ok(false);
            }

            // Safety: both stripes are held; the move is a pure
            // relocation, so no counters change.
            unsafe {
                let partial = from_bucket.partial(from.slot);
                let (key, value) = from_bucket.take_pair(from.slot);
                to_bucket.write_pair(to.slot, partial, key, value);
            }
            if let Hold::Final(two, _extra) = hold {
                // Hand the candidate stripes back to the caller; the
                // extra stripe unlocks as `_extra` drops.
                *b = two;
            }
            depth -= 1;
        }
        Ok(true)
    }

    // Finds (or makes) a slot for the key, looping over expansion retries.
    fn cuckoo_insert_loop<'a, const LOCKED: bool>(
        &'a self,
        hv: HashValue,
        b: &mut TwoBuckets<'a>,
        key: &K,
    ) -> Result<Insertion, Error> {
        loop {
            let hashpower = self.hashpower();
            match self.cuckoo_insert::<LOCKED>(hv, b, key) {
                InsertStatus::Open(pos) => return Ok(Insertion::Open(pos)),
                InsertStatus::Duplicate(pos) => return Ok(Insertion::Duplicate(pos)),
                InsertStatus::TableFull => {
                    // Expand and try again from scratch.
                    self.fast_double::<LOCKED>(hashpower, true)?;
                    *b = self.snapshot_and_lock_two::<LOCKED>(hv);
                }
                InsertStatus::UnderExpansion => {
                    // The table grew while we were cuckooing.
                    *b = self.snapshot_and_lock_two::<LOCKED>(hv);
                }
            }
        }
    }

    // The stripe to account an insert/erase against: the first-held lock,
    // or (in locked mode) the stripe covering the touched bucket.
    fn counter_lock<'a>(&'a self, b: &TwoBuckets<'a>, index: usize) -> &'a SeqLock {
        match b.first_lock() {
            Some(lock) => lock,
            None => self.stripes().stripe(lock_ind(index)),
        }
    }

    fn add_to_bucket(
        &self,
        b: &TwoBuckets<'_>,
        pos: TablePosition,
        partial: u8,
        key: K,
        value: V,
    ) {
        // Safety: the covering stripes are held (or the table is locked).
        unsafe {
            self.buckets()
                .bucket(pos.index)
                .write_pair(pos.slot, partial, key, value);
        }
        self.counter_lock(b, pos.index).counter_add(1);
    }

    fn del_from_bucket(&self, b: &TwoBuckets<'_>, pos: TablePosition) {
        // Safety: as for `add_to_bucket`.
        unsafe { self.buckets().bucket(pos.index).erase_pair(pos.slot) };
        self.counter_lock(b, pos.index).counter_add(-1);
    }

    // ---- public operation bodies ----

    /// Insert iff absent. Returns true if the pair was inserted.
    pub(crate) fn insert<const LOCKED: bool>(&self, key: K, value: V) -> Result<bool, Error> {
        let hv = self.hashed_key(&key);
        self.insert_hv::<LOCKED>(hv, key, value)
    }

    // Insert with a precomputed hash. The rebuild path hashes each key by
    // reference before moving its pair out of the old table, so a
    // panicking hasher fires while the pair is still in place.
    fn insert_hv<const LOCKED: bool>(&self, hv: HashValue, key: K, value: V) -> Result<bool, Error> {
        let mut b = self.snapshot_and_lock_two::<LOCKED>(hv);
        match self.cuckoo_insert_loop::<LOCKED>(hv, &mut b, &key)? {
            Insertion::Open(pos) => {
                self.add_to_bucket(&b, pos, hv.partial, key, value);
                Ok(true)
            }
            Insertion::Duplicate(_) => {
                b.unlock_clean();
                Ok(false)
            }
        }
    }

    /// Insert or overwrite. Returns true if the key was newly inserted.
    pub(crate) fn insert_or_assign<const LOCKED: bool>(
        &self,
        key: K,
        value: V,
    ) -> Result<bool, Error> {
        let hv = self.hashed_key(&key);
        let mut b = self.snapshot_and_lock_two::<LOCKED>(hv);
        match self.cuckoo_insert_loop::<LOCKED>(hv, &mut b, &key)? {
            Insertion::Open(pos) => {
                self.add_to_bucket(&b, pos, hv.partial, key, value);
                Ok(true)
            }
            Insertion::Duplicate(pos) => {
                // Safety: the covering stripes are held.
                unsafe { *self.buckets().bucket(pos.index).value_mut(pos.slot) = value };
                Ok(false)
            }
        }
    }

    /// The find-or-apply core: if the key is present, run `erase` on the
    /// value and remove the pair iff it returns true; otherwise insert
    /// `value`. Returns true on insert.
    pub(crate) fn uprase_fn<const LOCKED: bool, F>(
        &self,
        key: K,
        erase: F,
        value: V,
    ) -> Result<bool, Error>
    where
        F: FnOnce(&mut V) -> bool,
    {
        let hv = self.hashed_key(&key);
        let mut b = self.snapshot_and_lock_two::<LOCKED>(hv);
        match self.cuckoo_insert_loop::<LOCKED>(hv, &mut b, &key)? {
            Insertion::Open(pos) => {
                self.add_to_bucket(&b, pos, hv.partial, key, value);
                Ok(true)
            }
            Insertion::Duplicate(pos) => {
                // Safety: the covering stripes are held.
                let existing = unsafe { self.buckets().bucket(pos.index).value_mut(pos.slot) };
                if erase(existing) {
                    self.del_from_bucket(&b, pos);
                }
                // The mutator saw `&mut V`: dropping `b` bumps the epochs.
                Ok(false)
            }
        }
    }

    /// Mutate in place if present. Returns presence.
    pub(crate) fn update_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        let hv = self.hashed_key(key);
        let b = self.snapshot_and_lock_two::<false>(hv);
        match self.cuckoo_find(key, hv.partial, b.i1, b.i2) {
            Some(pos) => {
                // Safety: the covering stripes are held.
                f(unsafe { self.buckets().bucket(pos.index).value_mut(pos.slot) });
                true
            }
            None => {
                b.unlock_clean();
                false
            }
        }
    }

    /// Run `f` on the value if present; erase iff it returns true.
    /// Returns presence.
    pub(crate) fn erase_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        let hv = self.hashed_key(key);
        let b = self.snapshot_and_lock_two::<false>(hv);
        match self.cuckoo_find(key, hv.partial, b.i1, b.i2) {
            Some(pos) => {
                // Safety: the covering stripes are held.
                if f(unsafe { self.buckets().bucket(pos.index).value_mut(pos.slot) }) {
                    self.del_from_bucket(&b, pos);
                }
                true
            }
            None => {
                b.unlock_clean();
                false
            }
        }
    }

    /// Remove if present. Returns presence.
    pub(crate) fn erase<const LOCKED: bool, Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed_key(key);
        let b = self.snapshot_and_lock_two::<LOCKED>(hv);
        match self.cuckoo_find(key, hv.partial, b.i1, b.i2) {
            Some(pos) => {
                self.del_from_bucket(&b, pos);
                true
            }
            None => {
                b.unlock_clean();
                false
            }
        }
    }

    /// Locked-mode position lookup, for the locked view's accessors.
    pub(crate) fn find_position<Q>(&self, key: &Q) -> Option<TablePosition>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed_key(key);
        let b = self.snapshot_and_lock_two::<true>(hv);
        self.cuckoo_find(key, hv.partial, b.i1, b.i2)
    }

    // ---- migration ----

    // Reclassifies every old-half bucket of stripe `l` under the current
    // hashpower. Only reachable when the previous doubling was lazy, so
    // the old half is a multiple of the stripe count and both halves of
    // each move share the stripe; no counters change.
    fn migrate_stripe(&self, l: usize) {
        let old_hashpower = self.buckets().hashpower() - 1;
        let mut index = l;
        while index < hashsize(old_hashpower) {
            // Safety: the stripe covering both `index` and its buddy is
            // held by the caller.
            unsafe { self.move_bucket(old_hashpower, index, |_| {}) };
            index += MAX_STRIPES;
        }
    }

    // Moves the occupants of `old_index` that reclassify under
    // `old_hashpower + 1` into the buddy bucket in the new half.
    //
    // # Safety
    //
    // The caller must have exclusive access to both buckets.
    unsafe fn move_bucket(
        &self,
        old_hashpower: usize,
        old_index: usize,
        mut on_move: impl FnMut(usize),
    ) {
        let buckets = self.buckets();
        let old_bucket = buckets.bucket(old_index);
        let new_bucket = buckets.bucket(old_index + hashsize(old_hashpower));
        // The new half is untouched before migration, so moved pairs pack
        // from slot zero.
        let mut new_slot = 0;
        for slot in 0..SLOT_PER_BUCKET {
            if !old_bucket.occupied(slot) {
                continue;
            }
            let hv = self.hashed_key(old_bucket.key(slot));
            if need_to_move(hv, old_hashpower, old_index) {
                let partial = old_bucket.partial(slot);
                let (key, value) = old_bucket.take_pair(slot);
                new_bucket.write_pair(new_slot, partial, key, value);
                on_move(slot);
                new_slot += 1;
            }
        }
    }

    // Completes every stripe's pending migration, fanned out over the
    // configured worker threads.
    pub(crate) fn rehash_with_workers(&self) {
        let stripes = self.stripes();
        parallel::parallel_exec(self.worker_threads(), 0, stripes.len(), |start, end| {
            for l in start..end {
                let lock = stripes.stripe(l);
                if !SeqLock::is_migrated(lock.read_epoch()) {
                    self.migrate_stripe(l);
                    lock.set_migrated(true);
                }
            }
        });
    }

    // Under the all-stripes lock: finish outstanding lazy migration, which
    // can only exist when the table is past the stripe cap.
    fn rehash_all(&self, current_hashpower: usize) {
        if current_hashpower > MAX_STRIPES_POW {
            self.rehash_with_workers();
        }
    }

    // ---- resizing ----

    fn check_resize(
        &self,
        orig_hashpower: usize,
        new_hashpower: usize,
        automatic: bool,
    ) -> Result<bool, Error> {
        if let Some(maximum) = self.max_hashpower() {
            if new_hashpower > maximum {
                return Err(Error::MaxHashpowerExceeded {
                    requested: new_hashpower,
                    maximum,
                });
            }
        }
        if automatic {
            let load_factor = self.load_factor();
            let minimum = self.min_load_factor();
            if load_factor < minimum {
                return Err(Error::LoadFactorTooLow {
                    load_factor,
                    minimum,
                });
            }
        }
        if self.hashpower() != orig_hashpower {
            // Another expansion beat us to the locks.
            debug_log!("another expansion is ongoing");
            return Ok(false);
        }
        Ok(true)
    }

    // Doubles the table in place. Small tables migrate eagerly under the
    // all-stripes lock; larger ones mark every stripe unmigrated and let
    // migration ride on subsequent acquisitions (except in locked-table
    // mode, which must leave the buckets fully consistent).
    fn fast_double<const LOCKED: bool>(
        &self,
        current_hashpower: usize,
        automatic: bool,
    ) -> Result<(), Error> {
        let new_hashpower = current_hashpower + 1;
        let _all = self.lock_all::<LOCKED>();
        if !self.check_resize(current_hashpower, new_hashpower, automatic)? {
            return Ok(());
        }
        debug_log!(
            from = current_hashpower,
            to = new_hashpower,
            "doubling the table"
        );

        // Settle any migration left over from the previous doubling, so
        // every occupant is classified under `current_hashpower`.
        self.rehash_all(current_hashpower);

        // Grow the stripes before publishing the new hashpower, so nobody
        // can see the new hashpower with the old stripe count.
        if current_hashpower < MAX_STRIPES_POW {
            self.stripes().double(true, true);
        }
        self.buckets().double();

        if current_hashpower < MAX_STRIPES_POW {
            // Small table: stripes map one-to-one onto old buckets, so
            // incremental migration has nothing to hang off; do it now,
            // moving the counts along with the pairs.
            let stripes = self.stripes();
            let half = hashsize(current_hashpower);
            for old_index in 0..half {
                // Safety: every stripe is locked.
                unsafe {
                    self.move_bucket(current_hashpower, old_index, |_| {
                        stripes.stripe(lock_ind(old_index)).counter_add(-1);
                        stripes.stripe(lock_ind(old_index + half)).counter_add(1);
                    });
                }
            }
        } else {
            let stripes = self.stripes();
            for l in 0..stripes.len() {
                stripes.stripe(l).set_migrated(false);
            }
            if LOCKED {
                // The locked view promises fully-migrated buckets.
                self.rehash_with_workers();
            }
        }
        Ok(())
    }

    // Rebuilds into a fresh table at `new_hashpower` and swaps the arrays
    // in. Used for shrinks and explicit rehashes; the fresh table grows
    // itself if the requested hashpower cannot hold the data.
    fn change_capacity<const LOCKED: bool>(
        &self,
        new_hashpower: usize,
        automatic: bool,
    ) -> Result<(), Error>
    where
        S: Clone,
    {
        let _all = self.lock_all::<LOCKED>();
        let hashpower = self.hashpower();
        if !self.check_resize(hashpower, new_hashpower, automatic)? {
            return Ok(());
        }
        debug_log!(from = hashpower, to = new_hashpower, "rebuilding the table");

        self.rehash_all(hashpower);

        let fresh: RawTable<K, V, S> =
            RawTable::with_hashpower(new_hashpower, self.hash_builder.clone());
        // The rebuild must never refuse its own growth.
        fresh.min_load_factor.store(0f64.to_bits(), Ordering::Release);
        fresh.set_worker_threads(self.worker_threads());

        let buckets = self.buckets();
        parallel::parallel_exec(self.worker_threads(), 0, buckets.len(), |start, end| {
            for index in start..end {
                let bucket = buckets.bucket(index);
                for slot in 0..SLOT_PER_BUCKET {
                    if !bucket.occupied(slot) {
                        continue;
                    }
                    // Safety: every stripe is locked and workers cover
                    // disjoint bucket ranges.
                    //
                    // Hash before taking: if the hasher fails, the pair is
                    // still owned by the old table. The cloned hash
                    // builder hashes identically.
                    let hv = self.hashed_key(unsafe { bucket.key(slot) });
                    let (key, value) = unsafe { bucket.take_pair(slot) };
                    if fresh.insert_hv::<false>(hv, key, value).is_err() {
                        // The fresh table has no policy limits.
                        unreachable!("fresh table rejected an insert");
                    }
                }
            }
        });

        // Adopt the fresh arrays. Its stripes are locked first so our
        // caller's guard hands back a fully-locked table.
        let fresh_all = fresh.lock_all::<false>();
        mem::forget(fresh_all);
        let new_buckets = fresh.buckets.swap(ptr::null_mut(), Ordering::AcqRel);
        let new_stripes = fresh.stripes.swap(ptr::null_mut(), Ordering::AcqRel);
        drop(fresh);

        let old_buckets = self.buckets.swap(new_buckets, Ordering::AcqRel);
        let old_stripes = self.stripes.swap(new_stripes, Ordering::AcqRel);

        // Wake everything queued on the replaced stripes; those waiters
        // re-resolve against the new arrays and retry.
        // Safety: just unlinked, not yet retired.
        let old_stripes_ref = unsafe { &*old_stripes };
        for l in 0..old_stripes_ref.len() {
            old_stripes_ref.stripe(l).unlock();
        }

        let mut retired = self.retired.lock().unwrap_or_else(|poison| poison.into_inner());
        // Safety: both pointers came out of `Box::into_raw` and are no
        // longer reachable through the table fields.
        unsafe {
            retired.buckets.push(Box::from_raw(old_buckets));
            retired.stripes.push(Box::from_raw(old_stripes));
        }
        Ok(())
    }

    /// Resize to exactly `n` (growing or shrinking), via a full rebuild.
    pub(crate) fn rehash<const LOCKED: bool>(&self, n: usize) -> Result<bool, Error>
    where
        S: Clone,
    {
        assert!(n >= 1, "hashpower must be at least 1");
        if n == self.hashpower() {
            return Ok(false);
        }
        self.change_capacity::<LOCKED>(n, false)?;
        Ok(true)
    }

    /// Grow until at least `n` elements fit. Never shrinks.
    pub(crate) fn reserve<const LOCKED: bool>(&self, n: usize) -> Result<bool, Error>
    where
        S: Clone,
    {
        let new_hashpower = reserve_calc(n);
        if new_hashpower <= self.hashpower() {
            return Ok(false);
        }
        self.change_capacity::<LOCKED>(new_hashpower, false)?;
        Ok(true)
    }

    /// Destroy every pair, keeping the arrays.
    pub(crate) fn clear<const LOCKED: bool>(&self) {
        let _all = self.lock_all::<LOCKED>();
        let buckets = self.buckets();
        for index in 0..buckets.len() {
            // Safety: every stripe is locked.
            unsafe { buckets.bucket(index).clear() };
        }
        let stripes = self.stripes();
        for l in 0..stripes.len() {
            let lock = stripes.stripe(l);
            lock.reset_counter();
            lock.set_migrated(true);
        }
    }

}

// Locked-view access: positional accessors for a caller that holds every
// stripe. No hashing involved, so no hasher bounds.
impl<K, V, S> RawTable<K, V, S> {
    /// The first occupied position at or after `(index, slot)`, in
    /// bucket-slot order. Caller must hold every stripe.
    pub(crate) fn next_occupied(&self, index: usize, slot: usize) -> Option<TablePosition> {
        let buckets = self.buckets();
        let (mut index, mut slot) = (index, slot);
        while index < buckets.len() {
            while slot < SLOT_PER_BUCKET {
                if buckets.bucket(index).occupied(slot) {
                    return Some(TablePosition { index, slot });
                }
                slot += 1;
            }
            slot = 0;
            index += 1;
        }
        None
    }

    /// # Safety
    ///
    /// `pos` must be occupied and the caller must hold the covering
    /// stripe (or the whole table).
    pub(crate) unsafe fn pair_at(&self, pos: TablePosition) -> (&K, &V) {
        self.buckets().bucket(pos.index).pair(pos.slot)
    }

    /// # Safety
    ///
    /// As for [`RawTable::pair_at`], and no other live reference to the
    /// pair may exist.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn pair_at_mut(&self, pos: TablePosition) -> (&K, &mut V) {
        self.buckets().bucket(pos.index).pair_mut(pos.slot)
    }
}

impl<K, V, S> Drop for RawTable<K, V, S> {
    fn drop(&mut self) {
        let buckets = *self.buckets.get_mut();
        if !buckets.is_null() {
            // Safety: came out of Box::into_raw; exclusive access.
            drop(unsafe { Box::from_raw(buckets) });
        }
        let stripes = *self.stripes.get_mut();
        if !stripes.is_null() {
            // Safety: as above.
            drop(unsafe { Box::from_raw(stripes) });
        }
    }
}
