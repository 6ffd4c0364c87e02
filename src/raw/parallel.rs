//! Range-partitioned parallel execution for large resize passes.
//!
//! Splits `[start, end)` evenly between the calling thread and
//! `extra_threads` scoped workers. A panic on any worker is captured and
//! re-raised on the calling thread once every worker has been joined, so a
//! failing user hasher cannot strand detached threads inside the table.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

pub(crate) fn parallel_exec<F>(extra_threads: usize, start: usize, end: usize, func: F)
where
    F: Fn(usize, usize) + Sync,
{
    if extra_threads == 0 || end - start < 2 {
        func(start, end);
        return;
    }

    let workers = extra_threads + 1;
    let per_thread = (end - start) / workers;

    let mut payload = None;
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(extra_threads);
        let mut from = start;
        for _ in 0..extra_threads {
            let func = &func;
            handles.push(scope.spawn(move || func(from, from + per_thread)));
            from += per_thread;
        }

        // The calling thread takes the remainder; hold on to its panic so
        // the workers are still joined before unwinding.
        let own = panic::catch_unwind(AssertUnwindSafe(|| func(from, end)));

        for handle in handles {
            if let Err(caught) = handle.join() {
                payload.get_or_insert(caught);
            }
        }
        if let Err(caught) = own {
            payload.get_or_insert(caught);
        }
    });

    if let Some(caught) = payload {
        panic::resume_unwind(caught);
    }
}
