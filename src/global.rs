//! Process-wide heap. Initialized lazily on first use and never torn down
//! implicitly; call [`teardown`] to release its objects.

use std::sync::OnceLock;

use crate::{gcref::Gc, heap::Heap, internal::trace_trait::Trace, statistics::HeapStatistics};

static GLOBAL: OnceLock<Heap> = OnceLock::new();

pub fn global_heap() -> &'static Heap {
    GLOBAL.get_or_init(|| {
        log::debug!("[tgc] initializing process-wide heap");
        Heap::with_defaults()
    })
}

/// Allocates `value` on the process-wide heap.
pub fn allocate<T: Trace + 'static>(value: T) -> Gc<T> {
    global_heap().allocate(value)
}

pub fn allocate_array<T: Trace + 'static>(count: usize, init: impl FnMut(usize) -> T) -> Gc<T> {
    global_heap().allocate_array(count, init)
}

/// Advances collection of the process-wide heap.
pub fn collect(step_budget: usize) -> usize {
    global_heap().collect(step_budget)
}

pub fn teardown() -> usize {
    global_heap().teardown()
}

pub fn statistics() -> HeapStatistics {
    global_heap().statistics()
}
