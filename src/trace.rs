//! Zero-cost tracing helpers.
//!
//! With the `tracing` feature enabled these forward to the `tracing`
//! crate; without it they compile to nothing. Events are emitted at the
//! points where the table changes shape: doublings, rebuilds, stripe
//! migration, and cuckoo-path exhaustion.

#![allow(unused_macros, unused_imports)]

#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
