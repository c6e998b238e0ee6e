use std::{
    any::TypeId,
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::{null_mut, NonNull},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use modular_bitfield::prelude::*;

use crate::{
    collector::Collector, header::ObjMeta, heap::Heap, internal::trace_trait::Trace,
};

// Per-handle state word.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | index           |   62 | Position in the collector's handle table.|
// | interior        |    1 | Set once proven to live inside a payload.|
// | unused          |    1 |                                          |
// +-----------------+------+------------------------------------------+
//
// |index| is only written while the collector's state lock is held
// exclusively, |interior| only during root marking. Both are read under the
// shared lock.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct HandleBits {
    index: B62,
    interior: bool,
    #[skip]
    __: B1,
}

/// Target and owner of a handle. Always loaded and stored as one unit so a
/// copy never pairs one object's address with another object's owner.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    target: *mut u8,
    meta: *mut ObjMeta,
}

unsafe impl Send for Binding {}

impl Binding {
    pub(crate) const EMPTY: Binding = Binding {
        target: null_mut(),
        meta: null_mut(),
    };

    pub(crate) fn new(target: *mut u8, meta: Option<NonNull<ObjMeta>>) -> Self {
        Self {
            target,
            meta: meta.map_or(null_mut(), |meta| meta.as_ptr()),
        }
    }

    #[inline(always)]
    pub(crate) fn target(&self) -> *mut u8 {
        self.target
    }

    #[inline(always)]
    pub(crate) fn meta(&self) -> Option<NonNull<ObjMeta>> {
        NonNull::new(self.meta)
    }
}

/// The registered, address-stable part of a handle.
///
/// `Gc<T>` values move freely, so the collector tracks this heap-allocated
/// slot instead. A slot is a root until root marking proves that the `Gc`
/// owning it is stored inside a tracked payload (its "home").
pub struct PtrBase {
    collector: Arc<Collector>,
    binding: Atomic<Binding>,
    home: AtomicUsize,
    bits: AtomicU64,
}

impl PtrBase {
    /// Allocates an unbound root slot and appends it to the handle table.
    pub(crate) fn new(collector: Arc<Collector>) -> NonNull<PtrBase> {
        let slot = NonNull::from(Box::leak(Box::new(PtrBase {
            collector,
            binding: Atomic::new(Binding::EMPTY),
            home: AtomicUsize::new(0),
            bits: AtomicU64::new(0),
        })));
        unsafe { slot.as_ref().collector.register_ptr(slot) };
        slot
    }

    /// Removes `slot` from the handle table and frees it.
    pub(crate) unsafe fn release(slot: NonNull<PtrBase>) {
        slot.as_ref().collector.unregister_ptr(slot);
        drop(Box::from_raw(slot.as_ptr()));
    }

    /// Reads the slot of the `Gc` stored at `field`.
    #[inline(always)]
    pub(crate) unsafe fn from_field<'a>(field: *const u8) -> &'a PtrBase {
        (*field.cast::<NonNull<PtrBase>>()).as_ref()
    }

    #[inline(always)]
    fn load_bits(&self) -> HandleBits {
        HandleBits::from_bytes(self.bits.load(Ordering::Acquire).to_le_bytes())
    }

    #[inline(always)]
    fn store_bits(&self, bits: HandleBits) {
        self.bits
            .store(u64::from_le_bytes(bits.into_bytes()), Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    #[inline(always)]
    pub(crate) fn index(&self) -> usize {
        self.load_bits().index() as usize
    }

    #[inline(always)]
    pub(crate) fn set_index(&self, index: usize) {
        self.store_bits(self.load_bits().with_index(index as u64));
    }

    #[inline(always)]
    pub(crate) fn is_root(&self) -> bool {
        !self.load_bits().interior()
    }

    /// Marks the slot as interior. Never undone.
    pub(crate) fn demote(&self) {
        self.store_bits(self.load_bits().with_interior(true));
    }

    /// Address of the `Gc` field inside a payload, 0 when none is known.
    #[inline(always)]
    pub(crate) fn home(&self) -> usize {
        self.home.load(Ordering::Acquire)
    }

    /// Records that the `Gc` owning this slot was placed at `home` inside a
    /// payload under construction.
    pub(crate) fn adopt(&self, collector: &Arc<Collector>, home: usize) {
        assert!(
            Arc::ptr_eq(&self.collector, collector),
            "gc handle embedded in an object of a different heap"
        );
        self.home.store(home, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn binding(&self) -> Binding {
        self.binding.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn meta(&self) -> Option<NonNull<ObjMeta>> {
        self.binding().meta()
    }

    #[inline(always)]
    pub(crate) fn target(&self) -> *mut u8 {
        self.binding().target()
    }

    /// Raw redirection. Callers go through the collector so that the
    /// write observer runs under the same lock.
    #[inline(always)]
    pub(crate) fn store(&self, binding: Binding) {
        self.binding.store(binding, Ordering::Release);
    }

    /// Stores `binding` and returns the previous one.
    #[inline(always)]
    pub(crate) fn replace(&self, binding: Binding) -> Binding {
        self.binding.swap(binding, Ordering::AcqRel)
    }
}

/// Tracked handle to a heap object.
///
/// A `Gc` is either bound to an allocation, untracked (pointing at memory the
/// heap does not own) or empty. Cloning creates a new registered handle;
/// `set`, `reset`, `take`, `replace` and `swap` redirect an existing one and
/// work through `&self`, so handles stored inside heap objects can be updated.
#[repr(transparent)]
pub struct Gc<T> {
    slot: NonNull<PtrBase>,
    marker: PhantomData<*const T>,
}

unsafe impl<T: Send + Sync> Send for Gc<T> {}
unsafe impl<T: Send + Sync> Sync for Gc<T> {}

impl<T> Gc<T> {
    /// Creates an empty root handle on `heap`.
    pub fn empty(heap: &Heap) -> Self {
        Self::from_slot(PtrBase::new(heap.collector().clone()))
    }

    pub(crate) fn from_slot(slot: NonNull<PtrBase>) -> Self {
        Self {
            slot,
            marker: PhantomData,
        }
    }

    #[inline(always)]
    fn slot(&self) -> &PtrBase {
        unsafe { self.slot.as_ref() }
    }

    fn fresh(&self) -> Self {
        Self::from_slot(PtrBase::new(self.slot().collector().clone()))
    }

    fn redirect(&self, target: *mut u8, meta: Option<NonNull<ObjMeta>>) {
        let slot = self.slot();
        slot.collector().redirect(slot, Binding::new(target, meta));
    }

    pub fn is_empty(&self) -> bool {
        self.slot().target().is_null()
    }

    /// Whether this handle is bound to an allocation of its heap.
    pub fn is_tracked(&self) -> bool {
        self.slot().meta().is_some()
    }

    /// Whether the collector currently treats this handle as a root.
    pub fn is_root(&self) -> bool {
        self.slot().is_root()
    }

    pub fn as_ptr(&self) -> *const T {
        self.slot().target().cast::<T>()
    }

    pub fn get(&self) -> Option<&T> {
        unsafe { self.as_ptr().as_ref() }
    }

    /// Elements of the allocation from this handle's target to its end. An
    /// untracked handle yields its single target, an empty one nothing.
    pub fn elements(&self) -> &[T] {
        let binding = self.slot().binding();
        let target = binding.target();
        if target.is_null() {
            return &[];
        }
        let owner = binding.meta().map(|meta| unsafe { &*meta.as_ptr() });
        let len = match owner {
            Some(meta) if std::mem::size_of::<T>() != 0 => {
                let end = meta.payload_addr() + meta.payload_span();
                (end - target as usize) / std::mem::size_of::<T>()
            }
            Some(meta) => meta.count(),
            None => 1,
        };
        unsafe { std::slice::from_raw_parts(target.cast::<T>(), len) }
    }

    pub(crate) fn meta_ref(&self) -> Option<&ObjMeta> {
        self.slot()
            .meta()
            .map(|meta| unsafe { &*meta.as_ptr() })
    }

    fn check_same_heap(&self, other: &Gc<T>) {
        if other.is_tracked() {
            assert!(
                Arc::ptr_eq(self.slot().collector(), other.slot().collector()),
                "gc handles belong to different heaps"
            );
        }
    }

    /// Points this handle at `other`'s target.
    pub fn set(&self, other: &Gc<T>) {
        self.check_same_heap(other);
        let slot = self.slot();
        slot.collector().assign(slot, other.slot());
    }

    /// Empties this handle.
    pub fn reset(&self) {
        self.redirect(null_mut(), None);
    }

    /// Moves the target out into a new handle, leaving this one empty.
    pub fn take(&self) -> Gc<T> {
        let taken = self.fresh();
        taken.set(self);
        self.reset();
        taken
    }

    /// Points this handle at `other`'s target and returns the previous one.
    pub fn replace(&self, other: &Gc<T>) -> Gc<T> {
        let previous = self.fresh();
        previous.set(self);
        self.set(other);
        previous
    }

    pub fn swap(&self, other: &Gc<T>) {
        self.check_same_heap(other);
        other.check_same_heap(self);
        let slot = self.slot();
        slot.collector().exchange(slot, other.slot());
    }

    /// Identity of the targets, as opposed to `==` which compares owners.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.slot().target() == other.slot().target()
    }
}

impl<T: Trace + 'static> Gc<T> {
    /// Binds a handle to the tracked allocation containing `ptr`.
    ///
    /// When no allocation of this heap holds a `T` at `ptr` the handle is
    /// untracked: it still dereferences to `ptr` but keeps nothing alive.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or valid for reads of `T` for as long as the
    /// returned handle is dereferenced.
    pub unsafe fn from_raw(heap: &Heap, ptr: *const T) -> Gc<T> {
        let handle = Self::from_slot(PtrBase::new(heap.collector().clone()));
        let addr = ptr as usize;
        heap.collector().bind_raw(handle.slot(), ptr as *mut u8, |meta| {
            let class = meta.class_info();
            class.type_id() == TypeId::of::<T>()
                && (class.size() == 0 || (addr - meta.payload_addr()) % class.size() == 0)
        });
        handle
    }

    /// Returns a handle to `value` if it lives in a tracked allocation of `heap`.
    pub fn from_ref(heap: &Heap, value: &T) -> Option<Gc<T>> {
        let handle = unsafe { Self::from_raw(heap, value) };
        if handle.is_tracked() {
            Some(handle)
        } else {
            None
        }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        let copy = self.fresh();
        copy.set(self);
        copy
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        unsafe { PtrBase::release(self.slot) }
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        match self.get() {
            Some(value) => value,
            None => panic!("dereferenced an empty gc handle"),
        }
    }
}

/// Handles compare by owning allocation. Untracked handles compare by target.
impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        let (mine, theirs) = (self.slot().binding(), other.slot().binding());
        match (mine.meta(), theirs.meta()) {
            (None, None) => mine.target() == theirs.target(),
            (a, b) => a == b,
        }
    }
}

impl<T> Eq for Gc<T> {}

impl<T> fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.as_ptr())
    }
}

impl<T: fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => write!(f, "Gc({:?})", value),
            None => write!(f, "Gc(<empty>)"),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "<empty>"),
        }
    }
}
