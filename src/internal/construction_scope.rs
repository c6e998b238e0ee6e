use std::{cell::Cell, marker::PhantomData, ptr::NonNull, sync::Arc};

use crate::{
    collector::Collector,
    gcref::{Gc, PtrBase},
    header::ObjMeta,
};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Open while an allocation's payload is being placed on the current thread.
///
/// Only inside a scope are embedded handles given their in-payload position.
/// A scope that is dropped before [`ConstructionScope::finish`] (the
/// initializer panicked) unlinks the meta, drops the elements placed so far
/// and frees the storage.
pub(crate) struct ConstructionScope<'a> {
    collector: &'a Arc<Collector>,
    meta: NonNull<ObjMeta>,
    placed: usize,
    finished: bool,
    // Scopes nest on one thread and must not leave it.
    _not_send: PhantomData<*const ()>,
}

impl<'a> ConstructionScope<'a> {
    pub(crate) fn enter(collector: &'a Arc<Collector>, meta: NonNull<ObjMeta>) -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            collector,
            meta,
            placed: 0,
            finished: false,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn depth() -> usize {
        DEPTH.with(|depth| depth.get())
    }

    fn meta(&self) -> &ObjMeta {
        unsafe { self.meta.as_ref() }
    }

    /// Writes the next element of the payload.
    ///
    /// # Safety
    ///
    /// `T` must be the type the meta was allocated for and fewer than
    /// `count` elements may have been placed.
    pub(crate) unsafe fn place<T>(&mut self, value: T) {
        debug_assert!(self.placed < self.meta().count());
        self.meta()
            .element(self.placed)
            .cast::<T>()
            .write(value);
        self.placed += 1;
    }

    /// Registers the type's handle offsets on its first instance, then gives
    /// every embedded handle its home.
    fn adopt_embedded(&self) {
        let meta = self.meta();
        if self.placed == 0 {
            return;
        }
        let class = meta.class_info();
        unsafe { class.ensure_registered(self.collector, meta) };
        for index in 0..self.placed {
            let base = meta.element(index);
            for &offset in class.offsets() {
                unsafe {
                    let field = base.add(offset);
                    PtrBase::from_field(field).adopt(self.collector, field as usize);
                }
            }
        }
    }

    /// Completes construction and returns a root handle bound to element 0.
    pub(crate) fn finish<T>(mut self) -> Gc<T> {
        self.adopt_embedded();
        let slot = PtrBase::new(self.collector.clone());
        self.collector.publish(unsafe { slot.as_ref() }, self.meta);
        self.finished = true;
        Gc::from_slot(slot)
    }
}

impl Drop for ConstructionScope<'_> {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
        if self.finished {
            return;
        }
        log::debug!(
            "construction of {} aborted after {} element(s)",
            self.meta().class_info().type_name(),
            self.placed
        );
        self.collector.remove_obj(self.meta);
        unsafe {
            self.meta().finalize(self.placed);
            ObjMeta::free(self.meta);
        }
    }
}
