use std::{
    cell::Cell,
    marker::PhantomData,
    sync::atomic::{
        AtomicBool, AtomicI32, AtomicI64, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize,
    },
};

use crate::{gcref::Gc, visitor::Visitor};

/// Type-erased trace entry stored in [`ClassInfo`](crate::gc_info_table::ClassInfo).
pub type TraceCallback = unsafe fn(&mut Visitor<'_>, *const u8);

/// Trait specifying where the handles embedded in a `T` live.
///
/// `trace` is invoked exactly once per type, on the first instance placed on a
/// heap, to discover the byte offsets of embedded [`Gc`] fields. Afterwards the
/// collector only follows the recorded offsets.
///
/// # Safety
///
/// Implementations must visit every `Gc` stored inline in `self` (directly or
/// through inline fields such as arrays and nested structs) and nothing else.
/// The set of visited handles must not depend on the value: every instance of
/// the type has to expose handles at the same offsets. Handles behind another
/// indirection (`Box`, `Vec`, ...) must not be visited; they stay roots.
pub unsafe trait Trace {
    fn trace(&self, vis: &mut Visitor<'_>) {
        let _ = vis;
    }
}

/// Monomorphized trampoline recorded in the class table.
pub(crate) unsafe fn trace_erased<T: Trace>(vis: &mut Visitor<'_>, this: *const u8) {
    (*this.cast::<T>()).trace(vis);
}

unsafe impl<T> Trace for Gc<T> {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_handle(self);
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&self, vis: &mut Visitor<'_>) {
        for elem in self.iter() {
            vis.trace_ref(elem);
        }
    }
}

unsafe impl<A: Trace, B: Trace> Trace for (A, B) {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_ref(&self.0);
        vis.trace_ref(&self.1);
    }
}

unsafe impl<A: Trace, B: Trace, C: Trace> Trace for (A, B, C) {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_ref(&self.0);
        vis.trace_ref(&self.1);
        vis.trace_ref(&self.2);
    }
}

unsafe impl<T: ?Sized> Trace for PhantomData<T> {}
unsafe impl<T: ?Sized + 'static> Trace for &'static T {}
unsafe impl<T: Copy> Trace for Cell<T> {}

macro_rules! impl_prim {
    ($($t:ty)*) => {
        $(
            unsafe impl Trace for $t {}
        )*
    };
}

impl_prim! (
    () bool char f32 f64
    u8 u16 u32 u64 u128 usize
    i8 i16 i32 i64 i128 isize
    String std::path::PathBuf
    AtomicBool AtomicI32 AtomicI64 AtomicIsize AtomicU32 AtomicU64 AtomicUsize
);
