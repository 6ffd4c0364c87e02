use thiserror::Error;

/// Policy failures surfaced by resizing operations.
///
/// Lookup and removal never fail; only operations that may grow the table
/// can return one of these. The table is left unchanged in either case.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum Error {
    /// An automatic expansion was needed while the load factor sat below
    /// the configured minimum.
    ///
    /// A full table at a low load factor usually means the hash function
    /// is degenerate (or the input adversarial): expanding would double
    /// memory without fixing anything, so the insert fails instead. See
    /// [`CuckooMap::set_min_load_factor`](crate::CuckooMap::set_min_load_factor).
    #[error("automatic expansion requires load factor {load_factor:.4}, below the minimum {minimum:.4}")]
    LoadFactorTooLow {
        /// The load factor at the time of the failed expansion.
        load_factor: f64,
        /// The configured minimum.
        minimum: f64,
    },

    /// A resize would have grown the table beyond the configured maximum
    /// hashpower. See
    /// [`CuckooMap::set_max_hashpower`](crate::CuckooMap::set_max_hashpower).
    #[error("resize to hashpower {requested} exceeds the maximum {maximum}")]
    MaxHashpowerExceeded {
        /// The hashpower the resize needed.
        requested: usize,
        /// The configured maximum.
        maximum: usize,
    },
}
