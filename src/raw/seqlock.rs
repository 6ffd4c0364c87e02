//! The per-stripe seqlock word.
//!
//! A single 64-bit atomic encodes everything a stripe needs:
//!
//! ```text
//! bits 34..64   epoch counter, bumped on every modifying unlock
//! bit  33       writer lock
//! bit  32       migrated flag
//! bits  0..32   signed element counter (two's complement)
//! ```
//!
//! Readers snapshot the whole word with [`SeqLock::read_epoch`], run on the
//! data, and re-read: if any writer committed in between (or is still
//! holding the lock), the words differ and the reader retries. A writer
//! that took the lock but modified nothing releases it with
//! [`SeqLock::unlock_clean`], which restores the exact pre-lock word so
//! overlapping readers are not forced to retry.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot_core::SpinWait;

const EPOCH_ONE: u64 = 1 << 34;
const LOCK_BIT: u64 = 1 << 33;
const MIGRATED_BIT: u64 = 1 << 32;
const COUNTER_MASK: u64 = (1 << 32) - 1;

pub(crate) struct SeqLock {
    word: AtomicU64,
}

impl SeqLock {
    pub(crate) fn new(locked: bool, migrated: bool) -> SeqLock {
        let mut word = 0;
        if locked {
            word |= LOCK_BIT;
        }
        if migrated {
            word |= MIGRATED_BIT;
        }
        SeqLock {
            word: AtomicU64::new(word),
        }
    }

    /// The initial word for a fresh stripe, usable in constant context.
    pub(crate) const fn initial_word(locked: bool, migrated: bool) -> u64 {
        (if locked { LOCK_BIT } else { 0 }) | (if migrated { MIGRATED_BIT } else { 0 })
    }

    pub(crate) const fn from_word(word: u64) -> SeqLock {
        SeqLock {
            word: AtomicU64::new(word),
        }
    }

    #[inline]
    pub(crate) fn is_locked(word: u64) -> bool {
        word & LOCK_BIT != 0
    }

    #[inline]
    pub(crate) fn is_migrated(word: u64) -> bool {
        word & MIGRATED_BIT != 0
    }

    /// Snapshot the word for optimistic validation.
    #[inline]
    pub(crate) fn read_epoch(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Acquire the writer lock, spinning on contention. Returns the locked
    /// word value.
    #[inline]
    pub(crate) fn lock(&self) -> u64 {
        let mut spin = SpinWait::new();
        loop {
            let word = self.word.load(Ordering::Relaxed);
            if word & LOCK_BIT == 0 {
                match self.word.compare_exchange_weak(
                    word,
                    word | LOCK_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return word | LOCK_BIT,
                    Err(_) => continue,
                }
            }
            spin.spin();
        }
    }

    /// Release after a modification: clears the lock bit and bumps the
    /// epoch, forcing overlapping optimistic readers to retry.
    #[inline]
    pub(crate) fn unlock(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert!(word & LOCK_BIT != 0);
        self.word
            .store(word.wrapping_add(EPOCH_ONE) & !LOCK_BIT, Ordering::Release);
    }

    /// Release without bumping the epoch. Only valid when nothing covered
    /// by this stripe was modified while the lock was held.
    #[inline]
    pub(crate) fn unlock_clean(&self) {
        let word = self.word.load(Ordering::Relaxed);
        debug_assert!(word & LOCK_BIT != 0);
        self.word.store(word & !LOCK_BIT, Ordering::Release);
    }

    /// Set or clear the migrated flag. The caller must hold the lock, or
    /// otherwise have exclusive access to the stripe.
    #[inline]
    pub(crate) fn set_migrated(&self, migrated: bool) {
        let word = self.word.load(Ordering::Relaxed);
        let word = if migrated {
            word | MIGRATED_BIT
        } else {
            word & !MIGRATED_BIT
        };
        self.word.store(word, Ordering::Release);
    }

    /// Adjust the element counter. The caller must hold the lock, or
    /// otherwise have exclusive access to the stripe.
    ///
    /// Counters are credited to whichever stripe the writer locked first,
    /// so an individual stripe can transiently go negative; only the sum
    /// over all stripes is meaningful.
    #[inline]
    pub(crate) fn counter_add(&self, delta: i32) {
        let word = self.word.load(Ordering::Relaxed);
        let count = (word as u32).wrapping_add(delta as u32);
        self.word
            .store((word & !COUNTER_MASK) | count as u64, Ordering::Relaxed);
    }

    /// Read the (possibly negative) element counter.
    #[inline]
    pub(crate) fn counter(&self) -> i64 {
        self.word.load(Ordering::Relaxed) as u32 as i32 as i64
    }

    /// Zero the element counter. Caller must have exclusive access.
    #[inline]
    pub(crate) fn reset_counter(&self) {
        let word = self.word.load(Ordering::Relaxed);
        self.word.store(word & !COUNTER_MASK, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stripe() {
        let lock = SeqLock::new(false, true);
        let word = lock.read_epoch();
        assert!(!SeqLock::is_locked(word));
        assert!(SeqLock::is_migrated(word));
        assert_eq!(lock.counter(), 0);
    }

    #[test]
    fn lock_sets_bit() {
        let lock = SeqLock::new(false, true);
        let word = lock.lock();
        assert!(SeqLock::is_locked(word));
        assert!(SeqLock::is_locked(lock.read_epoch()));
        lock.unlock();
        assert!(!SeqLock::is_locked(lock.read_epoch()));
    }

    #[test]
    fn modifying_unlock_bumps_epoch() {
        let lock = SeqLock::new(false, true);
        let before = lock.read_epoch();
        lock.lock();
        lock.unlock();
        assert_ne!(before, lock.read_epoch());
    }

    #[test]
    fn clean_unlock_preserves_word() {
        let lock = SeqLock::new(false, true);
        let before = lock.read_epoch();
        lock.lock();
        lock.unlock_clean();
        assert_eq!(before, lock.read_epoch());
    }

    #[test]
    fn counter_survives_epoch_bumps() {
        let lock = SeqLock::new(false, true);
        lock.lock();
        lock.counter_add(5);
        lock.unlock();
        assert_eq!(lock.counter(), 5);

        lock.lock();
        lock.counter_add(-7);
        lock.unlock();
        assert_eq!(lock.counter(), -2);
        assert!(SeqLock::is_migrated(lock.read_epoch()));
    }

    #[test]
    fn negative_counter_does_not_leak_into_flags() {
        let lock = SeqLock::new(false, true);
        lock.lock();
        lock.counter_add(-1);
        assert!(SeqLock::is_migrated(lock.read_epoch()));
        assert!(SeqLock::is_locked(lock.read_epoch()));
        lock.counter_add(1);
        lock.unlock();
        assert_eq!(lock.counter(), 0);
    }

    #[test]
    fn migrated_flag_toggles() {
        let lock = SeqLock::new(false, true);
        lock.lock();
        lock.set_migrated(false);
        assert!(!SeqLock::is_migrated(lock.read_epoch()));
        lock.set_migrated(true);
        assert!(SeqLock::is_migrated(lock.read_epoch()));
        lock.unlock();
    }

    #[test]
    fn epoch_wraps_without_touching_counter() {
        let lock = SeqLock::new(false, true);
        lock.lock();
        lock.counter_add(3);
        lock.unlock();
        // Saturate the epoch field and bump it over the top.
        for _ in 0..4 {
            lock.lock();
            lock.unlock();
        }
        assert_eq!(lock.counter(), 3);
    }
}
