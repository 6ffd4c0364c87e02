use cuckoomap::CuckooMap;

/// Runs a test against several map configurations.
#[allow(dead_code)]
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> CuckooMap<K, V>)) {
    // The default table.
    test(&CuckooMap::new);

    // A minimal table, so operations cross several doublings.
    test(&(|| CuckooMap::builder().capacity(1).build()));

    // Preallocated, with extra worker threads for resize passes.
    test(
        &(|| {
            CuckooMap::builder()
                .capacity(1 << 12)
                .worker_threads(2)
                .build()
        }),
    );
}

/// Thread count for concurrent tests.
#[allow(dead_code)]
pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .clamp(4, 16)
}
