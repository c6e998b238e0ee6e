use std::{
    alloc::{alloc, dealloc, handle_alloc_error, Layout},
    fmt,
    ptr::NonNull,
    sync::atomic::AtomicBool,
};

use atomic::{Atomic, Ordering};

use crate::{
    error::{GcError, Result},
    gc_info_table::ClassInfo,
};

/// Tri-color mark state of an allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MarkColor {
    Unmarked,
    Gray,
    Alive,
}

// ObjMeta contains bookkeeping data per allocation and is prepended to the
// payload in the same block of memory.
//
// +-----------------+------------------------------------------------+
// | ObjMeta         | class, payload address, element count, layout,  |
// |                 | mark color, in-construction flag                |
// +-----------------+------------------------------------------------+
// | padding         | up to the payload type's alignment              |
// +-----------------+------------------------------------------------+
// | payload         | `count` consecutive instances                   |
// +-----------------+------------------------------------------------+
//
// Notes:
// - The meta exists before the payload is placed so handles embedded in the
//   payload can find their owner by address while it is being constructed.
// - |in construction| metas are never traced nor swept.
// - Metas are ordered by payload address in the collector's meta set.
pub struct ObjMeta {
    class_info: &'static ClassInfo,
    payload: NonNull<u8>,
    count: usize,
    layout: Layout,
    mark: Atomic<MarkColor>,
    constructing: AtomicBool,
}

impl ObjMeta {
    fn layout_for(class_info: &ClassInfo, count: usize) -> Result<(Layout, usize)> {
        let overflow = || GcError::CapacityOverflow {
            count,
            size: class_info.size(),
        };
        let bytes = class_info.size().checked_mul(count).ok_or_else(overflow)?;
        let payload =
            Layout::from_size_align(bytes, class_info.align()).map_err(|_| overflow())?;
        let (layout, offset) = Layout::new::<ObjMeta>()
            .extend(payload)
            .map_err(|_| overflow())?;
        Ok((layout.pad_to_align(), offset))
    }

    /// Allocates meta + payload storage. The payload is left uninitialized and
    /// the meta starts out in construction.
    ///
    /// Allocation failure aborts through [`handle_alloc_error`].
    pub(crate) unsafe fn allocate(
        class_info: &'static ClassInfo,
        count: usize,
    ) -> Result<NonNull<ObjMeta>> {
        let (layout, offset) = Self::layout_for(class_info, count)?;
        let mem = alloc(layout);
        if mem.is_null() {
            handle_alloc_error(layout);
        }
        let meta = mem.cast::<ObjMeta>();
        meta.write(ObjMeta {
            class_info,
            payload: NonNull::new_unchecked(mem.add(offset)),
            count,
            layout,
            mark: Atomic::new(MarkColor::Unmarked),
            constructing: AtomicBool::new(true),
        });
        Ok(NonNull::new_unchecked(meta))
    }

    /// Runs the destructor of the first `placed` elements.
    pub(crate) unsafe fn finalize(&self, placed: usize) {
        if let Some(finalize) = self.class_info.finalize {
            for index in 0..placed.min(self.count) {
                finalize(self.element(index));
            }
        }
    }

    /// Releases the storage of `this`. The payload must already be finalized.
    pub(crate) unsafe fn free(this: NonNull<ObjMeta>) {
        let layout = this.as_ref().layout;
        std::ptr::drop_in_place(this.as_ptr());
        dealloc(this.as_ptr().cast(), layout);
    }

    #[inline(always)]
    pub fn class_info(&self) -> &'static ClassInfo {
        self.class_info
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        self.payload.as_ptr()
    }

    #[inline(always)]
    pub fn payload_addr(&self) -> usize {
        self.payload.as_ptr() as usize
    }

    /// Address of element `index` of the payload.
    #[inline(always)]
    pub(crate) fn element(&self, index: usize) -> *mut u8 {
        unsafe { self.payload().add(index * self.class_info.size()) }
    }

    /// Number of instances in this allocation. 1 for non-array allocations.
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Total bytes of storage backing this allocation, meta included.
    #[inline(always)]
    pub fn allocation_size(&self) -> usize {
        self.layout.size()
    }

    #[inline(always)]
    pub fn payload_span(&self) -> usize {
        self.class_info.size() * self.count
    }

    #[inline(always)]
    pub fn contains_ptr(&self, addr: usize) -> bool {
        let start = self.payload_addr();
        start <= addr && addr < start + self.payload_span()
    }

    #[inline(always)]
    pub fn mark_state(&self) -> MarkColor {
        self.mark.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_mark_state(&self, color: MarkColor) {
        self.mark.store(color, Ordering::Release);
    }

    /// Colors an unmarked meta gray. Returns true when this call did it and the
    /// meta has to be queued.
    #[inline(always)]
    pub(crate) fn try_shade(&self) -> bool {
        self.mark
            .compare_exchange(
                MarkColor::Unmarked,
                MarkColor::Gray,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn is_constructing(&self) -> bool {
        self.constructing.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn finish_construction(&self) {
        self.constructing.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ObjMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjMeta")
            .field("class", &self.class_info.type_name())
            .field("payload", &self.payload)
            .field("count", &self.count)
            .field("mark", &self.mark_state())
            .field("constructing", &self.is_constructing())
            .finish()
    }
}
