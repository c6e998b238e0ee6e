use crate::{gcref::Gc, internal::trace_trait::Trace};

pub trait VisitorTrait {
    /// Called with the address of every `Gc` field reached by a trace walk.
    fn visit_handle(&mut self, field: *const u8);
}

pub struct Visitor<'a> {
    pub(crate) vis: &'a mut dyn VisitorTrait,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(vis: &'a mut dyn VisitorTrait) -> Self {
        Self { vis }
    }

    /// Trace method for inlined objects that are not allocated themselves but
    /// are stored inside a payload and have a trace() method.
    pub fn trace_ref<T: Trace + ?Sized>(&mut self, object: &T) {
        object.trace(self);
    }

    /// Reports a handle field. `handle` must be a reference to the field
    /// itself, not to a copy of it.
    pub fn trace_handle<T>(&mut self, handle: &Gc<T>) {
        self.vis.visit_handle(handle as *const Gc<T> as *const u8);
    }
}

/// Collects the addresses of the handles embedded in a freshly placed payload.
#[derive(Default)]
pub(crate) struct OffsetDiscovery {
    handles: Vec<usize>,
}

impl OffsetDiscovery {
    pub(crate) fn into_handles(self) -> Vec<usize> {
        self.handles
    }
}

impl VisitorTrait for OffsetDiscovery {
    fn visit_handle(&mut self, field: *const u8) {
        self.handles.push(field as usize);
    }
}
