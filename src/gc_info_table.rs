use std::{
    any::TypeId,
    collections::HashMap,
    fmt,
    mem::{align_of, size_of},
    ptr::NonNull,
    sync::OnceLock,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    collector::Collector,
    error::Result,
    header::ObjMeta,
    internal::{
        finalize_trait::{FinalizationCallback, FinalizeTrait},
        trace_trait::{trace_erased, Trace, TraceCallback},
    },
    visitor::{OffsetDiscovery, Visitor},
};

/// Whether a type's handle offsets may still change.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegistrationState {
    Open,
    Registered,
}

struct Registration {
    state: RegistrationState,
    offsets: Vec<usize>,
}

/// ClassInfo contains per-type metadata shared by every allocation of that type.
///
/// The list of embedded handle offsets starts empty and is filled while the
/// first instance is placed on a heap; it is frozen afterwards and read without
/// locking from then on.
pub struct ClassInfo {
    type_id: TypeId,
    type_name: &'static str,
    size: usize,
    align: usize,
    pub(crate) finalize: Option<FinalizationCallback>,
    pub(crate) trace: TraceCallback,
    /// Held for the whole first-instance discovery walk.
    first_construction: Mutex<()>,
    registration: RwLock<Registration>,
    frozen: OnceLock<Box<[usize]>>,
}

impl ClassInfo {
    pub(crate) fn new<T: Trace + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: size_of::<T>(),
            align: align_of::<T>(),
            finalize: <T as FinalizeTrait<T>>::CALLBACK,
            trace: trace_erased::<T>,
            first_construction: Mutex::new(()),
            registration: RwLock::new(Registration {
                state: RegistrationState::Open,
                offsets: Vec::new(),
            }),
            frozen: OnceLock::new(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Size of one instance. Array allocations keep their element count on the meta.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn state(&self) -> RegistrationState {
        if self.frozen.get().is_some() {
            RegistrationState::Registered
        } else {
            self.registration.read().state
        }
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Offsets of embedded handles relative to the start of one instance.
    /// Empty until the type is registered.
    #[inline]
    pub fn offsets(&self) -> &[usize] {
        match self.frozen.get() {
            Some(offsets) => offsets,
            None => &[],
        }
    }

    /// Records the offset of `handle` inside `owner`'s payload.
    ///
    /// Calls after the type is registered, offsets that do not grow past the
    /// last recorded one and positions outside the first element are ignored.
    /// Returns whether the offset was appended.
    pub(crate) fn register_offset(&self, owner: &ObjMeta, handle: *const u8) -> bool {
        if self.is_registered() {
            return false;
        }
        let offset = (handle as usize).wrapping_sub(owner.payload_addr());
        let mut registration = self.registration.write();
        if registration.state == RegistrationState::Registered {
            return false;
        }
        if offset >= self.size {
            log::trace!(
                "{}: handle at +{:#x} lies outside the first element",
                self.type_name,
                offset
            );
            return false;
        }
        if let Some(&last) = registration.offsets.last() {
            // constructor recursed or the walk revisited a field.
            if offset <= last {
                log::trace!(
                    "{}: ignoring non-monotonic handle offset {} (last {})",
                    self.type_name,
                    offset,
                    last
                );
                return false;
            }
        }
        registration.offsets.push(offset);
        true
    }

    /// Freezes the offset list. Later registrations are ignored.
    pub(crate) fn freeze(&self) {
        let mut registration = self.registration.write();
        registration.state = RegistrationState::Registered;
        if self
            .frozen
            .set(registration.offsets.clone().into_boxed_slice())
            .is_ok()
        {
            log::debug!(
                "registered {} handle offset(s) for {}: {:?}",
                registration.offsets.len(),
                self.type_name,
                registration.offsets
            );
        }
    }

    /// Discovers the handle offsets of this type from `meta`, the first instance
    /// placed on a heap. No-op once the type is registered.
    ///
    /// # Safety
    ///
    /// `meta` must hold at least one fully placed instance of this type.
    pub(crate) unsafe fn ensure_registered(&self, collector: &Collector, meta: &ObjMeta) {
        if self.is_registered() {
            return;
        }
        let _first = self.first_construction.lock();
        if self.is_registered() {
            return;
        }

        let mut discovery = OffsetDiscovery::default();
        (self.trace)(&mut Visitor::new(&mut discovery), meta.payload());

        // declaration order is not layout order in Rust structs.
        let mut homes = discovery.into_handles();
        homes.sort_unstable();
        for home in homes {
            if let Some(owner) = collector.find_owner_meta(home) {
                let owner = owner.as_ref();
                owner.class_info().register_offset(owner, home as *const u8);
            }
        }
        self.freeze();
    }

    /// Allocates combined meta + payload storage for `count` instances and
    /// registers the meta with `collector`. The payload is left unplaced.
    pub(crate) fn new_meta(
        &'static self,
        collector: &Collector,
        count: usize,
    ) -> Result<NonNull<ObjMeta>> {
        let meta = unsafe { ObjMeta::allocate(self, count)? };
        collector.add_obj(meta);
        Ok(meta)
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("state", &self.state())
            .field("offsets", &self.offsets())
            .finish()
    }
}

/// Process-wide `TypeId -> ClassInfo` map. Entries are leaked and live for the
/// rest of the process.
pub struct ClassInfoTable {
    map: OnceLock<RwLock<HashMap<TypeId, &'static ClassInfo>>>,
}

pub(crate) static CLASS_TABLE: ClassInfoTable = ClassInfoTable {
    map: OnceLock::new(),
};

impl ClassInfoTable {
    fn map(&self) -> &RwLock<HashMap<TypeId, &'static ClassInfo>> {
        self.map.get_or_init(|| RwLock::new(HashMap::new()))
    }

    pub fn class_info_of<T: Trace + 'static>(&self) -> &'static ClassInfo {
        let type_id = TypeId::of::<T>();
        if let Some(info) = self.map().read().get(&type_id).copied() {
            return info;
        }
        let mut map = self.map().write();
        *map.entry(type_id)
            .or_insert_with(|| &*Box::leak(Box::new(ClassInfo::new::<T>())))
    }

    pub fn len(&self) -> usize {
        self.map().read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
