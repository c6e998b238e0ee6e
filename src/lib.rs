//! tgc is an embeddable, hybrid incremental garbage collector.
//!
//! Objects are placed on a [`Heap`] and referenced through [`Gc`] handles.
//! A handle lives outside the heap (a root) until the collector proves it is
//! stored inside a tracked object; from then on it is an edge of the object
//! graph. The collector is a cooperative mark-and-sweep state machine driven by
//! [`Heap::collect`] with a step budget, so embedders decide when and how much
//! collection work runs, from any thread.
//!
//! Types placed on a heap implement [`Trace`] to expose their embedded handles.
//! The walk runs once per type, on its first instance, and records the byte
//! offsets of the handles. The collector only uses those offsets afterwards.
//!
//! ```
//! use tgc::{Gc, Heap, Trace, Visitor};
//!
//! struct Node {
//!     next: Gc<Node>,
//! }
//!
//! unsafe impl Trace for Node {
//!     fn trace(&self, vis: &mut Visitor<'_>) {
//!         vis.trace_handle(&self.next);
//!     }
//! }
//!
//! let heap = Heap::with_defaults();
//! let a = heap.allocate(Node { next: heap.empty() });
//! let b = heap.allocate(Node { next: a.clone() });
//! a.next.set(&b);
//! drop((a, b));
//! heap.full_collect();
//! assert_eq!(heap.statistics().metas, 0);
//! ```

/// Logs a collector event at `info` when the heap is verbose and at `debug`
/// otherwise.
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        } else {
            log::debug!($($t)*);
        }
    };
}

pub mod collector;
pub mod error;
pub mod gc_info_table;
pub mod gcref;
pub mod global;
pub mod header;
pub mod heap;
pub mod internal;
pub mod statistics;
pub mod visitor;

#[cfg(test)]
mod tests;

pub use collector::Phase;
pub use error::{GcError, Result};
pub use gcref::Gc;
pub use global::{allocate, allocate_array, collect, global_heap, teardown};
pub use heap::Heap;
pub use internal::trace_trait::Trace;
pub use statistics::HeapStatistics;
pub use visitor::Visitor;

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Handle table slots reserved up front.
    pub initial_handle_capacity: usize,
    /// Gray queue slots reserved up front.
    pub initial_gray_capacity: usize,
    /// Step budget used by [`Heap::collect_step`]
    pub default_step_budget: usize,
    /// Log cycle summaries at `info` instead of `debug`
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_handle_capacity: 5 * 1024,
            initial_gray_capacity: 2 * 1024,
            default_step_budget: 256,
            verbose: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.default_step_budget == 0 {
            return Err(GcError::InvalidConfig(
                "default_step_budget must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
