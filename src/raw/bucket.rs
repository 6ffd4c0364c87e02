//! Fixed-capacity bucket storage.
//!
//! A bucket holds up to [`SLOT_PER_BUCKET`] key/value pairs in raw storage,
//! constructed and destroyed in place. Occupancy bits and partial tags are
//! atomics so that optimistic readers can load them while a writer holds
//! the covering stripe; pair storage sits behind `UnsafeCell` for the same
//! reason. A bucket has no `Drop` impl (live pairs are dropped by whoever
//! owns the array), so a raw byte snapshot of a bucket is inert.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// The number of slots in each bucket.
pub(crate) const SLOT_PER_BUCKET: usize = 4;

#[repr(C)]
pub(crate) struct Bucket<K, V> {
    occupied: [AtomicBool; SLOT_PER_BUCKET],
    partials: [AtomicU8; SLOT_PER_BUCKET],
    pairs: [UnsafeCell<MaybeUninit<(K, V)>>; SLOT_PER_BUCKET],
}

impl<K, V> Bucket<K, V> {
    /// An empty bucket. Bucket arrays are normally carved out of zeroed
    /// allocations, which is the same state.
    #[cfg(test)]
    pub(crate) fn empty() -> Bucket<K, V> {
        // Safety: zeroed atomics are valid (all slots unoccupied), and the
        // pair storage is MaybeUninit.
        unsafe { MaybeUninit::zeroed().assume_init() }
    }

    #[inline]
    pub(crate) fn occupied(&self, slot: usize) -> bool {
        self.occupied[slot].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn partial(&self, slot: usize) -> u8 {
        self.partials[slot].load(Ordering::Relaxed)
    }

    /// Raw pointer to a slot's pair storage, for optimistic byte snapshots.
    #[inline]
    pub(crate) fn pair_ptr(&self, slot: usize) -> *const MaybeUninit<(K, V)> {
        self.pairs[slot].get()
    }

    /// # Safety
    ///
    /// The slot must be occupied and the caller must hold the covering
    /// stripe lock (or otherwise have exclusive write access).
    #[inline]
    pub(crate) unsafe fn key(&self, slot: usize) -> &K {
        debug_assert!(self.occupied(slot));
        &(*(*self.pairs[slot].get()).as_ptr()).0
    }

    /// # Safety
    ///
    /// As for [`Bucket::key`]; additionally no other reference to this
    /// slot's pair may be live.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn value_mut(&self, slot: usize) -> &mut V {
        debug_assert!(self.occupied(slot));
        &mut (*(*self.pairs[slot].get()).as_mut_ptr()).1
    }

    /// # Safety
    ///
    /// As for [`Bucket::key`].
    #[inline]
    pub(crate) unsafe fn pair(&self, slot: usize) -> (&K, &V) {
        debug_assert!(self.occupied(slot));
        let pair = (*self.pairs[slot].get()).as_ptr();
        (&(*pair).0, &(*pair).1)
    }

    /// # Safety
    ///
    /// As for [`Bucket::value_mut`].
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn pair_mut(&self, slot: usize) -> (&K, &mut V) {
        debug_assert!(self.occupied(slot));
        let pair = (*self.pairs[slot].get()).as_mut_ptr();
        (&(*pair).0, &mut (*pair).1)
    }

    /// Construct a pair in an empty slot.
    ///
    /// # Safety
    ///
    /// The slot must be unoccupied and the caller must hold the covering
    /// stripe lock (or otherwise have exclusive write access).
    #[inline]
    pub(crate) unsafe fn write_pair(&self, slot: usize, partial: u8, key: K, value: V) {
        debug_assert!(!self.occupied(slot));
        (*self.pairs[slot].get()).write((key, value));
        self.partials[slot].store(partial, Ordering::Relaxed);
        self.occupied[slot].store(true, Ordering::Relaxed);
    }

    /// Move a pair out of a slot, leaving it unoccupied.
    ///
    /// # Safety
    ///
    /// As for [`Bucket::write_pair`], but the slot must be occupied.
    #[inline]
    pub(crate) unsafe fn take_pair(&self, slot: usize) -> (K, V) {
        debug_assert!(self.occupied(slot));
        self.occupied[slot].store(false, Ordering::Relaxed);
        ptr::read((*self.pairs[slot].get()).as_ptr())
    }

    /// Destroy the pair in a slot, leaving it unoccupied.
    ///
    /// # Safety
    ///
    /// As for [`Bucket::take_pair`].
    #[inline]
    pub(crate) unsafe fn erase_pair(&self, slot: usize) {
        debug_assert!(self.occupied(slot));
        self.occupied[slot].store(false, Ordering::Relaxed);
        ptr::drop_in_place((*self.pairs[slot].get()).as_mut_ptr());
    }

    /// Destroy every live pair in the bucket.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the bucket.
    pub(crate) unsafe fn clear(&self) {
        for slot in 0..SLOT_PER_BUCKET {
            if self.occupied(slot) {
                self.erase_pair(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_take_erase() {
        let bucket: Bucket<u64, String> = Bucket::empty();
        for slot in 0..SLOT_PER_BUCKET {
            assert!(!bucket.occupied(slot));
        }

        unsafe {
            bucket.write_pair(1, 0xab, 7, "seven".to_string());
            assert!(bucket.occupied(1));
            assert_eq!(bucket.partial(1), 0xab);
            assert_eq!(*bucket.key(1), 7);

            let (k, v) = bucket.take_pair(1);
            assert_eq!((k, v.as_str()), (7, "seven"));
            assert!(!bucket.occupied(1));

            bucket.write_pair(0, 1, 1, "one".to_string());
            bucket.write_pair(3, 2, 2, "two".to_string());
            bucket.clear();
            assert!(!bucket.occupied(0));
            assert!(!bucket.occupied(3));
        }
    }

    #[test]
    fn value_mut_updates_in_place() {
        let bucket: Bucket<u32, u32> = Bucket::empty();
        unsafe {
            bucket.write_pair(2, 9, 10, 100);
            *bucket.value_mut(2) += 1;
            let (_, v) = bucket.take_pair(2);
            assert_eq!(v, 101);
        }
    }
}
