//! A concurrent hash table based on bucketized cuckoo hashing, with
//! optimistic seqlock reads and lazy in-place resizing.
//!
//! # Overview
//!
//! [`CuckooMap`] maps each key to one of two candidate buckets of four
//! slots each, chosen by the key's hash and a one-byte partial tag. An
//! insert that finds both candidates full searches (breadth-first) for a
//! chain of displacements that frees a slot, then replays that chain under
//! fine-grained locks.
//!
//! Buckets are protected by up to 2^16 *stripes*, each an epoch-stamped
//! seqlock word. Readers take no locks at all: they snapshot the candidate
//! slots, then validate that the stripe epochs did not move. Writers lock
//! the two stripes covering a key's candidates, in stripe order.
//!
//! When the table fills it doubles in place. Past the stripe cap the
//! doubling is lazy: stripes are marked stale and each one is migrated by
//! the first operation that locks it afterwards, so no single operation
//! pays for the whole table.
//!
//! # Usage
//!
//! The map shares through a reference, so plain scoped threads (or an
//! `Arc`) are all that is needed:
//!
//! ```
//! use cuckoomap::CuckooMap;
//! use std::thread;
//!
//! let map = CuckooMap::new();
//! thread::scope(|s| {
//!     s.spawn(|| map.insert("a", 1).unwrap());
//!     s.spawn(|| map.insert("b", 2).unwrap());
//! });
//!
//! assert_eq!(map.get(&"a"), Some(1));
//! assert_eq!(map.len(), 2);
//! ```
//!
//! Lookups return cloned snapshots rather than references: nothing a
//! reader holds can dangle across a concurrent resize. In-place mutation
//! goes through the closure-taking operations ([`CuckooMap::update`],
//! [`CuckooMap::upsert`], [`CuckooMap::remove_if`], ...), which run the
//! closure under the entry's stripe locks.
//!
//! Iteration requires exclusive access to the whole table through
//! [`CuckooMap::lock_table`]:
//!
//! ```
//! use cuckoomap::CuckooMap;
//!
//! let map = CuckooMap::from([(1, "one"), (2, "two")]);
//! let locked = map.lock_table();
//! let mut keys: Vec<_> = locked.iter().map(|(k, _)| *k).collect();
//! keys.sort();
//! assert_eq!(keys, [1, 2]);
//! ```
//!
//! # Resizing policy
//!
//! Automatic expansion can be bounded in two ways: a minimum load factor
//! below which a full table refuses to double (catching degenerate hash
//! functions), and a maximum hashpower capping total growth. Both
//! conditions surface as [`Error`] values from the inserting operations;
//! everything else is infallible. Large rebuilds can be spread over
//! worker threads with [`CuckooMap::set_worker_threads`].
//!
//! # Features
//!
//! - `serde`: `Serialize`/`Deserialize` for [`CuckooMap`].
//! - `rayon`: `FromParallelIterator`/`ParallelExtend` for [`CuckooMap`].
//! - `tracing`: debug-level events for resizes and migrations.

mod error;
mod locked;
mod map;
mod raw;
mod trace;

#[cfg(feature = "rayon")]
mod rayon_impls;
#[cfg(feature = "serde")]
mod serde_impls;

pub use error::Error;
pub use locked::{Iter, IterMut, LockedTable};
pub use map::{CuckooMap, CuckooMapBuilder};
