use std::sync::Arc;

use crate::{
    collector::{Collector, Phase},
    error::Result,
    gcref::Gc,
    internal::{construction_scope::ConstructionScope, gc_info::ClassInfoTrait, trace_trait::Trace},
    statistics::HeapStatistics,
    Config,
};

/// A collector context. Handles created through a heap keep its collector
/// alive; dropping the heap tears the collector down and unbinds whatever
/// handles remain.
pub struct Heap {
    collector: Arc<Collector>,
}

impl Heap {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if config.verbose {
            log::info!("[tgc] heap created with {:?}", config);
        }
        Ok(Self {
            collector: Collector::new(config),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            collector: Collector::new(Config::default()),
        }
    }

    pub(crate) fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn config(&self) -> &Config {
        self.collector.config()
    }

    pub fn phase(&self) -> Phase {
        self.collector.phase()
    }

    /// Creates an empty root handle.
    pub fn empty<T>(&self) -> Gc<T> {
        Gc::empty(self)
    }

    fn construct<T: Trace + 'static>(
        &self,
        count: usize,
        fill: impl FnOnce(&mut ConstructionScope<'_>),
    ) -> Result<Gc<T>> {
        let meta = T::class_info().new_meta(&self.collector, count)?;
        let mut scope = ConstructionScope::enter(&self.collector, meta);
        fill(&mut scope);
        Ok(scope.finish())
    }

    /// Places `value` on the heap and returns a root handle to it.
    pub fn allocate<T: Trace + 'static>(&self, value: T) -> Gc<T> {
        let result = self.construct(1, |scope| unsafe { scope.place(value) });
        match result {
            Ok(handle) => handle,
            Err(err) => panic!("{}", err),
        }
    }

    /// Places `count` instances produced by `init` in one allocation. The
    /// returned handle points at element 0.
    ///
    /// If `init` panics the elements produced so far are dropped and the
    /// allocation is released.
    pub fn try_allocate_array<T: Trace + 'static>(
        &self,
        count: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Gc<T>> {
        self.construct(count, |scope| {
            for index in 0..count {
                let value = init(index);
                unsafe { scope.place(value) };
            }
        })
    }

    /// Like [`Heap::try_allocate_array`], panicking on capacity overflow.
    pub fn allocate_array<T: Trace + 'static>(
        &self,
        count: usize,
        init: impl FnMut(usize) -> T,
    ) -> Gc<T> {
        match self.try_allocate_array(count, init) {
            Ok(handle) => handle,
            Err(err) => panic!("{}", err),
        }
    }

    /// Runs at most `step_budget` units of collection work. Returns the number
    /// of objects destroyed.
    pub fn collect(&self, step_budget: usize) -> usize {
        self.collector.collect(step_budget)
    }

    /// [`Heap::collect`] with the configured default budget.
    pub fn collect_step(&self) -> usize {
        self.collector.collect(self.config().default_step_budget)
    }

    /// Finishes the current cycle.
    pub fn full_collect(&self) -> usize {
        self.collector.full_cycle()
    }

    pub fn statistics(&self) -> HeapStatistics {
        self.collector.statistics()
    }

    pub fn dump_stats(&self) {
        log::info!("{}", self.statistics());
    }

    /// Releases every allocation of this heap, see [`Collector::teardown`].
    pub fn teardown(&self) -> usize {
        self.collector.teardown()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.collector.teardown();
    }
}
