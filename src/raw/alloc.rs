//! Segmented storage for buckets and stripe locks.
//!
//! Both arrays grow by appending a segment equal in size to everything
//! allocated so far, so existing elements never move and an in-place
//! doubling is a single allocation plus two atomic stores. Optimistic
//! readers may hold references into an array that a rebuild has since
//! replaced; replaced arrays are therefore retired to a side list by the
//! table and only freed on drop.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::raw::bucket::Bucket;
use crate::raw::seqlock::SeqLock;
use crate::raw::utils::CachePadded;
use crate::raw::{MAX_STRIPES, MAX_STRIPES_POW};

// Segment 0 holds the initial buckets; every later segment doubles the
// table, and a hashpower of at most 63 bounds the segment count.
const MAX_BUCKET_SEGMENTS: usize = 64;

// Stripe counts are capped at 2^16, and the smallest table has 2 stripes.
const MAX_STRIPE_SEGMENTS: usize = MAX_STRIPES_POW + 1;

unsafe fn alloc_array<T>(len: usize) -> *mut T {
    let layout = Layout::array::<T>(len).unwrap();
    let ptr = alloc_zeroed(layout);
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr.cast()
}

unsafe fn dealloc_array<T>(ptr: *mut T, len: usize) {
    let layout = Layout::array::<T>(len).unwrap();
    dealloc(ptr.cast(), layout);
}

// Locates element `i` of a segmented array whose first segment holds
// `1 << initial_pow` elements. Returns (segment, offset).
#[inline]
fn locate(initial_pow: usize, i: usize) -> (usize, usize) {
    if i < (1 << initial_pow) {
        (0, i)
    } else {
        let top = usize::BITS as usize - 1 - i.leading_zeros() as usize;
        (top - initial_pow + 1, i ^ (1 << top))
    }
}

// The length of a given segment under the same scheme.
#[inline]
fn segment_len(initial_pow: usize, segment: usize) -> usize {
    if segment == 0 {
        1 << initial_pow
    } else {
        1 << (initial_pow + segment - 1)
    }
}

/// The bucket table: `2^hashpower` buckets in doubling segments.
///
/// The hashpower lives here so that an optimistic reader's view of the
/// bucket count can never disagree with the array it is indexing.
pub(crate) struct BucketArray<K, V> {
    hashpower: AtomicUsize,
    initial_hashpower: usize,
    segments: [AtomicPtr<Bucket<K, V>>; MAX_BUCKET_SEGMENTS],
}

impl<K, V> BucketArray<K, V> {
    pub(crate) fn new(hashpower: usize) -> Box<BucketArray<K, V>> {
        assert!(hashpower >= 1 && hashpower < MAX_BUCKET_SEGMENTS);
        let array = BucketArray {
            hashpower: AtomicUsize::new(hashpower),
            initial_hashpower: hashpower,
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        };
        // Safety: zeroed buckets are valid empty buckets.
        array.segments[0].store(unsafe { alloc_array(1 << hashpower) }, Ordering::Release);
        Box::new(array)
    }

    #[inline]
    pub(crate) fn hashpower(&self) -> usize {
        self.hashpower.load(Ordering::Acquire)
    }

    /// The number of buckets.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        1 << self.hashpower()
    }

    #[inline]
    pub(crate) fn bucket(&self, i: usize) -> &Bucket<K, V> {
        let (segment, offset) = locate(self.initial_hashpower, i);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        // Safety: `i` is below the published bucket count, so the segment
        // has been allocated and published.
        unsafe { &*base.add(offset) }
    }

    /// Append a segment of empty buckets equal to the current size, then
    /// publish the new hashpower. Caller must hold every stripe lock.
    pub(crate) fn double(&self) {
        let hashpower = self.hashpower.load(Ordering::Relaxed);
        let segment = hashpower - self.initial_hashpower + 1;
        assert!(segment < MAX_BUCKET_SEGMENTS, "table exceeded maximum capacity");
        self.segments[segment].store(unsafe { alloc_array(1 << hashpower) }, Ordering::Release);
        self.hashpower.store(hashpower + 1, Ordering::Release);
    }
}

impl<K, V> Drop for BucketArray<K, V> {
    fn drop(&mut self) {
        // Drop any pairs still alive, then the segments themselves.
        for i in 0..self.len() {
            // Safety: `&mut self` gives exclusive access.
            unsafe { self.bucket(i).clear() };
        }
        for segment in 0..MAX_BUCKET_SEGMENTS {
            let ptr = self.segments[segment].load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe { dealloc_array(ptr, segment_len(self.initial_hashpower, segment)) };
            }
        }
    }
}

/// The stripe table: a power-of-two number of seqlocks, at most
/// [`MAX_STRIPES`], in the same doubling-segment scheme as the buckets.
pub(crate) struct StripeArray {
    count: AtomicUsize,
    initial_pow: usize,
    segments: [AtomicPtr<CachePadded<SeqLock>>; MAX_STRIPE_SEGMENTS],
}

impl StripeArray {
    pub(crate) fn new(count: usize, locked: bool, migrated: bool) -> Box<StripeArray> {
        assert!(count.is_power_of_two() && count <= MAX_STRIPES);
        let array = StripeArray {
            count: AtomicUsize::new(count),
            initial_pow: count.trailing_zeros() as usize,
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        };
        array.segments[0].store(
            unsafe { Self::alloc_stripes(count, locked, migrated) },
            Ordering::Release,
        );
        Box::new(array)
    }

    unsafe fn alloc_stripes(len: usize, locked: bool, migrated: bool) -> *mut CachePadded<SeqLock> {
        // A zeroed SeqLock word is unlocked, unmigrated, zero counter;
        // patch in the requested initial word.
        let base: *mut CachePadded<SeqLock> = alloc_array(len);
        let word = SeqLock::initial_word(locked, migrated);
        if word != 0 {
            for i in 0..len {
                ptr::write(base.add(i), CachePadded::new(SeqLock::from_word(word)));
            }
        }
        base
    }

    /// The number of stripes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn stripe(&self, l: usize) -> &SeqLock {
        let (segment, offset) = locate(self.initial_pow, l);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        // Safety: `l` is below the published stripe count.
        unsafe { &(*base.add(offset)).value }
    }

    /// Double the stripe count, creating the new stripes in the given
    /// state. Caller must hold every existing stripe lock.
    pub(crate) fn double(&self, locked: bool, migrated: bool) {
        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(count * 2 <= MAX_STRIPES);
        let segment = count.trailing_zeros() as usize - self.initial_pow + 1;
        self.segments[segment].store(
            unsafe { Self::alloc_stripes(count, locked, migrated) },
            Ordering::Release,
        );
        self.count.store(count * 2, Ordering::Release);
    }
}

impl Drop for StripeArray {
    fn drop(&mut self) {
        for segment in 0..MAX_STRIPE_SEGMENTS {
            let ptr = self.segments[segment].load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe { dealloc_array(ptr, segment_len(self.initial_pow, segment)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_segments() {
        assert_eq!(locate(2, 0), (0, 0));
        assert_eq!(locate(2, 3), (0, 3));
        assert_eq!(locate(2, 4), (1, 0));
        assert_eq!(locate(2, 7), (1, 3));
        assert_eq!(locate(2, 8), (2, 0));
        assert_eq!(locate(2, 15), (2, 7));
        assert_eq!(locate(2, 16), (3, 0));
        assert_eq!(segment_len(2, 0), 4);
        assert_eq!(segment_len(2, 1), 4);
        assert_eq!(segment_len(2, 3), 16);
    }

    #[test]
    fn bucket_array_doubles_in_place() {
        let array: Box<BucketArray<u64, u64>> = BucketArray::new(2);
        assert_eq!(array.len(), 4);
        let before = array.bucket(1) as *const _;
        array.double();
        assert_eq!(array.len(), 8);
        assert_eq!(array.bucket(1) as *const _, before);
        for i in 0..8 {
            for slot in 0..crate::raw::bucket::SLOT_PER_BUCKET {
                assert!(!array.bucket(i).occupied(slot));
            }
        }
    }

    #[test]
    fn bucket_array_drops_live_pairs() {
        let array: Box<BucketArray<u64, String>> = BucketArray::new(2);
        unsafe { array.bucket(3).write_pair(0, 7, 1, "x".repeat(100)) };
        drop(array);
    }

    #[test]
    fn stripe_array_initial_state() {
        let stripes = StripeArray::new(4, true, true);
        assert_eq!(stripes.len(), 4);
        for l in 0..4 {
            let word = stripes.stripe(l).read_epoch();
            assert!(SeqLock::is_locked(word));
            assert!(SeqLock::is_migrated(word));
        }
        stripes.double(false, true);
        assert_eq!(stripes.len(), 8);
        assert!(!SeqLock::is_locked(stripes.stripe(5).read_epoch()));
    }
}
