use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use crate::locked::LockedTable;
use crate::raw::{self, RawTable};
use crate::Error;

/// A concurrent hash table using bucketized cuckoo hashing with striped
/// seqlocks.
///
/// Every key lives in one of two candidate buckets derived from its hash.
/// Lookups are optimistic: they copy out of the table and validate a
/// per-stripe epoch rather than taking locks, so readers never block
/// writers. Writers lock at most two (briefly three) of up to 65536
/// stripes. The table doubles in place and migrates entries lazily, stripe
/// by stripe, on the critical path of later operations.
///
/// Because lookups return snapshots, values are required to be [`Clone`]
/// for the reading methods; entries themselves are never exposed by
/// reference except through [`CuckooMap::lock_table`].
///
/// # Examples
///
/// ```
/// use cuckoomap::CuckooMap;
///
/// let map = CuckooMap::new();
/// map.insert("apples", 3).unwrap();
/// map.insert("pears", 1).unwrap();
///
/// assert_eq!(map.get(&"apples"), Some(3));
/// map.update(&"apples", |n| *n += 1);
/// assert_eq!(map.get(&"apples"), Some(4));
///
/// assert!(map.remove(&"pears"));
/// assert_eq!(map.len(), 1);
/// ```
///
/// All element operations are safe to call from many threads at once:
///
/// ```
/// use cuckoomap::CuckooMap;
/// use std::thread;
///
/// let map = CuckooMap::new();
/// thread::scope(|s| {
///     for t in 0..4 {
///         let map = &map;
///         s.spawn(move || {
///             for i in 0..100 {
///                 map.insert(t * 100 + i, i).unwrap();
///             }
///         });
///     }
/// });
/// assert_eq!(map.len(), 400);
/// ```
pub struct CuckooMap<K, V, S = RandomState> {
    raw: RawTable<K, V, S>,
}

/// A builder for a [`CuckooMap`].
///
/// # Examples
///
/// ```
/// use cuckoomap::CuckooMap;
/// use std::collections::hash_map::RandomState;
///
/// let map: CuckooMap<u64, u64> = CuckooMap::builder()
///     // Space for 2048 elements up front.
///     .capacity(2048)
///     // The hasher to use.
///     .hasher(RandomState::new())
///     // Refuse automatic expansion below 10% occupancy.
///     .min_load_factor(0.1)
///     // Never grow beyond 2^20 buckets.
///     .max_hashpower(Some(20))
///     // Use three extra threads for large resizes.
///     .worker_threads(3)
///     .build();
/// ```
pub struct CuckooMapBuilder<K, V, S = RandomState> {
    hasher: S,
    capacity: usize,
    min_load_factor: f64,
    max_hashpower: Option<usize>,
    worker_threads: usize,
    _kv: PhantomData<(K, V)>,
}

impl<K, V> CuckooMapBuilder<K, V> {
    /// Set the hash builder used to hash keys.
    ///
    /// Warning: `hasher` is normally randomly generated, and is designed
    /// to resist hash-flooding attacks. A predictable hasher also makes
    /// the cuckoo insertion path degenerate under adversarial keys.
    pub fn hasher<S>(self, hasher: S) -> CuckooMapBuilder<K, V, S> {
        CuckooMapBuilder {
            hasher,
            capacity: self.capacity,
            min_load_factor: self.min_load_factor,
            max_hashpower: self.max_hashpower,
            worker_threads: self.worker_threads,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> CuckooMapBuilder<K, V, S> {
    /// Set the initial capacity of the map, in elements.
    pub fn capacity(self, capacity: usize) -> Self {
        CuckooMapBuilder { capacity, ..self }
    }

    /// Set the minimum load factor for automatic expansion. See
    /// [`CuckooMap::set_min_load_factor`].
    pub fn min_load_factor(self, min_load_factor: f64) -> Self {
        CuckooMapBuilder {
            min_load_factor,
            ..self
        }
    }

    /// Cap the table's growth. See [`CuckooMap::set_max_hashpower`].
    pub fn max_hashpower(self, max_hashpower: Option<usize>) -> Self {
        CuckooMapBuilder {
            max_hashpower,
            ..self
        }
    }

    /// Set the number of extra threads used by large resize passes. See
    /// [`CuckooMap::set_worker_threads`].
    pub fn worker_threads(self, worker_threads: usize) -> Self {
        CuckooMapBuilder {
            worker_threads,
            ..self
        }
    }

    /// Construct a [`CuckooMap`] with the configured options.
    pub fn build(self) -> CuckooMap<K, V, S> {
        let raw = RawTable::with_capacity(self.capacity, self.hasher);
        raw.set_min_load_factor(self.min_load_factor);
        raw.set_max_hashpower(self.max_hashpower);
        raw.set_worker_threads(self.worker_threads);
        CuckooMap { raw }
    }
}

impl<K, V, S> fmt::Debug for CuckooMapBuilder<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooMapBuilder")
            .field("capacity", &self.capacity)
            .field("min_load_factor", &self.min_load_factor)
            .field("max_hashpower", &self.max_hashpower)
            .field("worker_threads", &self.worker_threads)
            .finish()
    }
}

impl<K, V> CuckooMap<K, V> {
    /// Creates an empty map with a small initial table.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    /// let map: CuckooMap<&str, i32> = CuckooMap::new();
    /// ```
    pub fn new() -> CuckooMap<K, V> {
        CuckooMap::with_capacity_and_hasher(0, RandomState::new())
    }

    /// Creates an empty map with room for at least `capacity` elements
    /// before any resizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    /// let map: CuckooMap<&str, i32> = CuckooMap::with_capacity(1000);
    /// assert!(map.capacity() >= 1000);
    /// ```
    pub fn with_capacity(capacity: usize) -> CuckooMap<K, V> {
        CuckooMap::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Returns a builder for more detailed configuration.
    pub fn builder() -> CuckooMapBuilder<K, V> {
        CuckooMapBuilder {
            hasher: RandomState::new(),
            capacity: 0,
            min_load_factor: raw::DEFAULT_MIN_LOAD_FACTOR,
            max_hashpower: None,
            worker_threads: 0,
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> CuckooMap<K, V, S> {
    /// Creates an empty map which will use the given hash builder.
    pub fn with_hasher(hash_builder: S) -> CuckooMap<K, V, S> {
        CuckooMap::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates an empty map with the given capacity and hash builder.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> CuckooMap<K, V, S> {
        CuckooMap {
            raw: RawTable::with_capacity(capacity, hash_builder),
        }
    }

    /// Returns a reference to the map's hash builder.
    pub fn hasher(&self) -> &S {
        self.raw.hash_builder()
    }

    /// Returns the number of elements in the map.
    ///
    /// The count is assembled from per-stripe counters without locking,
    /// so it can be momentarily stale while writers are active.
    pub fn len(&self) -> usize {
        self.raw.size()
    }

    /// Returns `true` if the map holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns log₂ of the bucket count.
    pub fn hashpower(&self) -> usize {
        self.raw.hashpower()
    }

    /// Returns the number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.raw.bucket_count()
    }

    /// Returns the number of slots: `bucket_count()` times the slots per
    /// bucket.
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns `len() / capacity()`.
    pub fn load_factor(&self) -> f64 {
        self.raw.load_factor()
    }

    /// Returns the minimum load factor below which automatic expansion
    /// fails. Defaults to `0.05`.
    pub fn min_load_factor(&self) -> f64 {
        self.raw.min_load_factor()
    }

    /// Sets the minimum load factor for automatic expansion.
    ///
    /// When an insert needs to grow the table while occupancy is below
    /// this fraction, the insert fails with
    /// [`Error::LoadFactorTooLow`](crate::Error::LoadFactorTooLow)
    /// instead: a full-but-empty table signals a degenerate hash
    /// function. Explicit [`rehash`](CuckooMap::rehash) and
    /// [`reserve`](CuckooMap::reserve) calls are exempt.
    ///
    /// # Panics
    ///
    /// Panics if `min_load_factor` is outside `[0, 1]`.
    pub fn set_min_load_factor(&self, min_load_factor: f64) {
        self.raw.set_min_load_factor(min_load_factor);
    }

    /// Returns the maximum hashpower the table may grow to, if any.
    pub fn max_hashpower(&self) -> Option<usize> {
        self.raw.max_hashpower()
    }

    /// Caps the table's growth at `2^max` buckets. A resize past the cap
    /// fails with
    /// [`Error::MaxHashpowerExceeded`](crate::Error::MaxHashpowerExceeded).
    /// `None` removes the cap.
    ///
    /// # Panics
    ///
    /// Panics if the current hashpower already exceeds `max`.
    pub fn set_max_hashpower(&self, max: Option<usize>) {
        self.raw.set_max_hashpower(max);
    }

    /// Returns the number of extra threads used for large resize passes.
    pub fn worker_threads(&self) -> usize {
        self.raw.worker_threads()
    }

    /// Sets the number of extra threads spawned for large batch work: the
    /// migration sweep of a doubling under a locked table, and full
    /// rebuilds. Zero (the default) keeps everything on the calling
    /// thread.
    pub fn set_worker_threads(&self, threads: usize) {
        self.raw.set_worker_threads(threads);
    }
}

impl<K, V, S> CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    /// Returns a snapshot of the value for `key`, if present.
    ///
    /// This is the optimistic read path: no locks are taken, and a
    /// concurrent writer only costs a retry. The returned value is a
    /// clone; it does not track later updates.
    ///
    /// Note that the clone races with concurrent removals of the same
    /// entry: if `V` owns heap allocations, a removal committing in the
    /// narrow window after validation can invalidate what the clone
    /// reads. Keys and values that are plain data are unaffected.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, "a").unwrap();
    /// assert_eq!(map.get(&1), Some("a"));
    /// assert_eq!(map.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.raw.read_value(key, V::clone)
    }

    /// Invokes `f` on a snapshot of the value for `key`. Returns whether
    /// the key was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, 10).unwrap();
    ///
    /// let mut seen = None;
    /// assert!(map.get_with(&1, |v| seen = Some(v)));
    /// assert_eq!(seen, Some(10));
    /// ```
    pub fn get_with<Q>(&self, key: &Q, f: impl FnOnce(V)) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        match self.raw.read_value(key, V::clone) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    /// Returns `true` if the map contains `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, "a").unwrap();
    /// assert!(map.contains_key(&1));
    /// assert!(!map.contains_key(&2));
    /// ```
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.read_value(key, |_| ()).is_some()
    }

    /// Inserts `key → value` if the key is absent. Returns `true` if the
    /// pair was inserted, `false` if the key was already present (the
    /// existing value is untouched).
    ///
    /// May resize the table; resizing is the only way this can fail.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// assert_eq!(map.insert(1, "a").unwrap(), true);
    /// assert_eq!(map.insert(1, "b").unwrap(), false);
    /// assert_eq!(map.get(&1), Some("a"));
    /// ```
    pub fn insert(&self, key: K, value: V) -> Result<bool, Error> {
        self.raw.insert::<false>(key, value)
    }

    /// Inserts `key → value`, overwriting any existing value. Returns
    /// `true` if the key was newly inserted.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// assert_eq!(map.insert_or_assign(1, "a").unwrap(), true);
    /// assert_eq!(map.insert_or_assign(1, "b").unwrap(), false);
    /// assert_eq!(map.get(&1), Some("b"));
    /// ```
    pub fn insert_or_assign(&self, key: K, value: V) -> Result<bool, Error> {
        self.raw.insert_or_assign::<false>(key, value)
    }

    /// Applies `modify` to the existing value, or inserts `value` if the
    /// key is absent. Returns `true` on insert.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// assert!(map.upsert(1, |n| *n += 1, 10).unwrap());
    /// assert!(!map.upsert(1, |n| *n += 1, 10).unwrap());
    /// assert_eq!(map.get(&1), Some(11));
    /// ```
    pub fn upsert(&self, key: K, modify: impl FnOnce(&mut V), value: V) -> Result<bool, Error> {
        self.raw.uprase_fn::<false, _>(
            key,
            move |existing| {
                modify(existing);
                false
            },
            value,
        )
    }

    /// Like [`upsert`](CuckooMap::upsert), but removes the entry when the
    /// closure returns `true`. Returns `true` on insert.
    ///
    /// # Examples
    ///
    /// A reference-counted erase:
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.upsert_or_remove(1, |n| { *n -= 1; *n == 0 }, 2).unwrap();
    /// map.upsert_or_remove(1, |n| { *n -= 1; *n == 0 }, 2).unwrap();
    /// assert_eq!(map.get(&1), Some(1));
    /// map.upsert_or_remove(1, |n| { *n -= 1; *n == 0 }, 2).unwrap();
    /// assert_eq!(map.get(&1), None);
    /// ```
    pub fn upsert_or_remove(
        &self,
        key: K,
        f: impl FnOnce(&mut V) -> bool,
        value: V,
    ) -> Result<bool, Error> {
        self.raw.uprase_fn::<false, _>(key, f, value)
    }

    /// Replaces the value for `key` if present. Returns presence.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// assert!(!map.assign(&1, "a"));
    /// map.insert(1, "a").unwrap();
    /// assert!(map.assign(&1, "b"));
    /// assert_eq!(map.get(&1), Some("b"));
    /// ```
    pub fn assign<Q>(&self, key: &Q, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.update_fn(key, move |existing| *existing = value)
    }

    /// Mutates the value for `key` in place, under the stripe locks.
    /// Returns presence.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, 10).unwrap();
    /// assert!(map.update(&1, |n| *n += 1));
    /// assert!(!map.update(&2, |n| *n += 1));
    /// assert_eq!(map.get(&1), Some(11));
    /// ```
    pub fn update<Q>(&self, key: &Q, f: impl FnOnce(&mut V)) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.update_fn(key, f)
    }

    /// Removes the entry for `key`. Returns presence.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, "a").unwrap();
    /// assert!(map.remove(&1));
    /// assert!(!map.remove(&1));
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.erase::<false, Q>(key)
    }

    /// Invokes `f` on the value for `key` and removes the entry iff `f`
    /// returns `true`. Returns presence.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, 1).unwrap();
    /// // Decrement, dropping the entry at zero.
    /// assert!(map.remove_if(&1, |n| { *n -= 1; *n == 0 }));
    /// assert_eq!(map.get(&1), None);
    /// ```
    pub fn remove_if<Q>(&self, key: &Q, f: impl FnOnce(&mut V) -> bool) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.erase_fn(key, f)
    }

    /// Resizes the table to exactly `2^n` buckets, rebuilding it in full.
    ///
    /// Shrinks as well as grows; if the current elements cannot fit in
    /// `2^n` buckets the result ends up larger than requested. Returns
    /// `true` if the hashpower changed. Not subject to the minimum load
    /// factor.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map: CuckooMap<u32, u32> = CuckooMap::new();
    /// let hp = map.hashpower();
    /// assert!(map.rehash(hp + 2).unwrap());
    /// assert!(!map.rehash(hp + 2).unwrap());
    /// ```
    pub fn rehash(&self, n: usize) -> Result<bool, Error>
    where
        S: Clone,
    {
        self.raw.rehash::<false>(n)
    }

    /// Grows the table until it can hold at least `n` elements. Returns
    /// `true` if the table grew. Never shrinks.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map: CuckooMap<u32, u32> = CuckooMap::new();
    /// map.reserve(10_000).unwrap();
    /// assert!(map.capacity() >= 10_000);
    /// ```
    pub fn reserve(&self, n: usize) -> Result<bool, Error>
    where
        S: Clone,
    {
        self.raw.reserve::<false>(n)
    }

    /// Removes every element, running destructors. Keeps the current
    /// bucket and stripe arrays.
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, "a").unwrap();
    /// map.clear();
    /// assert!(map.is_empty());
    /// ```
    pub fn clear(&self) {
        self.raw.clear::<false>();
    }

    /// Locks the whole table for exclusive bulk access.
    ///
    /// The returned view holds every stripe lock: it can iterate, mutate
    /// in place, and insert or remove without further locking, while
    /// concurrent operations from other threads block until it drops.
    /// Any pending lazy migration is completed up front (using the
    /// configured worker threads).
    ///
    /// # Examples
    ///
    /// ```
    /// use cuckoomap::CuckooMap;
    ///
    /// let map = CuckooMap::new();
    /// map.insert(1, 10).unwrap();
    /// map.insert(2, 20).unwrap();
    ///
    /// let mut total = 0;
    /// for (_, v) in map.lock_table().iter() {
    ///     total += *v;
    /// }
    /// assert_eq!(total, 30);
    /// ```
    pub fn lock_table(&self) -> LockedTable<'_, K, V, S> {
        LockedTable::new(&self.raw)
    }
}

impl<K, V, S> Default for CuckooMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        CuckooMap::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + fmt::Debug,
    V: Send + Sync + fmt::Debug,
    S: BuildHasher + Sync,
{
    /// Formats the map by locking it; other threads' operations block for
    /// the duration.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locked = self.lock_table();
        f.debug_map().entries(locked.iter()).finish()
    }
}

impl<K, V, S> Clone for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + Clone,
    V: Send + Sync + Clone,
    S: BuildHasher + Sync + Clone,
{
    /// Copies the contents through a locked view. Not a concurrency-safe
    /// operation: a clone taken while other threads write captures an
    /// unspecified interleaving.
    fn clone(&self) -> Self {
        let clone = CuckooMap::with_capacity_and_hasher(self.capacity(), self.hasher().clone());
        clone.set_min_load_factor(self.min_load_factor());
        clone.set_max_hashpower(self.max_hashpower());
        clone.set_worker_threads(self.worker_threads());
        for (key, value) in self.lock_table().iter() {
            let inserted = clone
                .insert(key.clone(), value.clone())
                .expect("clone target has the source's capacity");
            debug_assert!(inserted);
        }
        clone
    }
}

impl<K, V, S> PartialEq for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync + Clone + PartialEq,
    S: BuildHasher + Sync,
{
    /// Compares by locking `self` and probing `other` optimistically.
    /// Not linearizable under concurrent writes to either map.
    fn eq(&self, other: &Self) -> bool {
        let locked = self.lock_table();
        if locked.len() != other.len() {
            return false;
        }
        locked
            .iter()
            .all(|(key, value)| other.get(key).as_ref() == Some(value))
    }
}

impl<K, V, S> Eq for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync + Clone + Eq,
    S: BuildHasher + Sync,
{
}

impl<K, V, S> FromIterator<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let (lower, _) = iter.size_hint();
        let map = CuckooMap::with_capacity_and_hasher(lower, S::default());
        for (key, value) in iter {
            map.raw
                .uprase_fn::<false, _>(key, |_| false, value)
                .expect("default policy never refuses expansion");
        }
        map
    }
}

impl<K, V, S> Extend<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert_or_assign(key, value)
                .expect("extend failed to resize the table");
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for CuckooMap<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}
