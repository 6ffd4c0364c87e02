/// Pads and aligns a value to the length of a cache line.
///
/// Stripe seqlocks are stored in arrays; without padding, RMW traffic on one
/// stripe invalidates the line holding its neighbors.
// Source: https://github.com/crossbeam-rs/crossbeam/blob/master/crossbeam-utils/src/cache_padded.rs
#[derive(Debug, Default)]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
pub(crate) struct CachePadded<T> {
    pub value: T,
}

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> CachePadded<T> {
        CachePadded { value }
    }
}
