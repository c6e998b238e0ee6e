use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    gcref::{Binding, PtrBase},
    header::{MarkColor, ObjMeta},
    statistics::HeapStatistics,
    Config,
};

/// Phase of the incremental collection cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    RootMarking,
    ChildMarking,
    Sweeping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::RootMarking => "root marking",
            Phase::ChildMarking => "child marking",
            Phase::Sweeping => "sweeping",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct MetaRef(NonNull<ObjMeta>);

impl MetaRef {
    #[inline(always)]
    fn get(&self) -> &ObjMeta {
        unsafe { self.0.as_ref() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HandleRef(NonNull<PtrBase>);

impl HandleRef {
    #[inline(always)]
    fn get(&self) -> &PtrBase {
        unsafe { self.0.as_ref() }
    }
}

unsafe impl Send for MetaRef {}
unsafe impl Send for HandleRef {}

struct CollectorState {
    /// Every live handle slot. A slot's index is stored in the slot itself.
    pointers: Vec<HandleRef>,
    /// Every allocation keyed by payload address.
    metas: BTreeMap<usize, MetaRef>,
    phase: Phase,
    /// Handles below this index were visited in the current root marking.
    next_root_marking: usize,
    /// Key of the next meta to sweep. `None` once the pass reached the end.
    next_sweeping: Option<usize>,
    swept_this_cycle: usize,
}

impl CollectorState {
    /// Address-interval lookup of the allocation whose payload contains `addr`.
    fn find_owner(&self, addr: usize) -> Option<NonNull<ObjMeta>> {
        let (_, meta) = self.metas.range(..=addr).next_back()?;
        if meta.get().contains_ptr(addr) {
            Some(meta.0)
        } else {
            None
        }
    }

    fn meta_after(&self, key: usize) -> Option<usize> {
        self.metas
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(key, _)| *key)
    }
}

/// Owner of the handle table, the meta set and the gray queue.
///
/// Structural changes take the state lock exclusively. Handle redirections
/// and address lookups take it shared; the gray queue has its own mutex so
/// shared holders can enqueue. The state lock is always taken before the gray
/// queue lock.
pub struct Collector {
    config: Config,
    state: RwLock<CollectorState>,
    gray: Mutex<Vec<MetaRef>>,
    cycles: AtomicUsize,
    total_swept: AtomicUsize,
    total_allocated: AtomicUsize,
}

unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

impl Collector {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(CollectorState {
                pointers: Vec::with_capacity(config.initial_handle_capacity),
                metas: BTreeMap::new(),
                phase: Phase::RootMarking,
                next_root_marking: 0,
                next_sweeping: None,
                swept_this_cycle: 0,
            }),
            gray: Mutex::new(Vec::with_capacity(config.initial_gray_capacity)),
            cycles: AtomicUsize::new(0),
            total_swept: AtomicUsize::new(0),
            total_allocated: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    /// Number of completed collection cycles.
    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::Relaxed)
    }

    /// No allocations and no cycle in progress.
    pub fn is_idle(&self) -> bool {
        let state = self.state.read();
        state.metas.is_empty() && state.phase == Phase::RootMarking
    }

    pub(crate) fn add_obj(&self, meta: NonNull<ObjMeta>) {
        let meta = MetaRef(meta);
        self.state.write().metas.insert(meta.get().payload_addr(), meta);
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlinks a meta whose construction was abandoned.
    pub(crate) fn remove_obj(&self, meta: NonNull<ObjMeta>) {
        let mut state = self.state.write();
        let key = unsafe { meta.as_ref() }.payload_addr();
        if state.next_sweeping == Some(key) {
            state.next_sweeping = state.meta_after(key);
        }
        state.metas.remove(&key);
    }

    pub(crate) fn find_owner_meta(&self, addr: usize) -> Option<NonNull<ObjMeta>> {
        self.state.read().find_owner(addr)
    }

    pub(crate) fn register_ptr(&self, slot: NonNull<PtrBase>) {
        let mut state = self.state.write();
        unsafe { slot.as_ref() }.set_index(state.pointers.len());
        state.pointers.push(HandleRef(slot));
    }

    /// Swap-removes `slot` from the handle table.
    pub(crate) fn unregister_ptr(&self, slot: NonNull<PtrBase>) {
        let mut state = self.state.write();
        let index = unsafe { slot.as_ref() }.index();
        if state.pointers.get(index) != Some(&HandleRef(slot)) {
            log::warn!("handle {:p} is not registered at index {}", slot, index);
            return;
        }
        let last = state.pointers.len() - 1;
        state.pointers.swap_remove(index);
        if index == last {
            return;
        }
        let moved = state.pointers[index];
        moved.get().set_index(index);
        // An unvisited handle moved into the visited region.
        if state.phase == Phase::RootMarking
            && index < state.next_root_marking
            && last >= state.next_root_marking
        {
            self.resolve_owner(&state, moved.get());
            self.try_mark_root(moved.get());
        }
    }

    /// Points `slot` at `binding` and runs the write observer.
    pub(crate) fn redirect(&self, slot: &PtrBase, binding: Binding) {
        let state = self.state.read();
        slot.store(binding);
        self.on_pointee_changed(&state, slot);
    }

    /// Copies `source` into `slot`. The source is read under the lock so the
    /// copied target cannot be swept in between.
    pub(crate) fn assign(&self, slot: &PtrBase, source: &PtrBase) {
        let state = self.state.read();
        slot.store(source.binding());
        self.on_pointee_changed(&state, slot);
    }

    pub(crate) fn exchange(&self, a: &PtrBase, b: &PtrBase) {
        let state = self.state.read();
        let previous = a.replace(b.binding());
        b.store(previous);
        self.on_pointee_changed(&state, a);
        self.on_pointee_changed(&state, b);
    }

    /// Binds `slot` to a freshly constructed allocation and makes the
    /// allocation visible to marking and sweeping.
    pub(crate) fn publish(&self, slot: &PtrBase, meta: NonNull<ObjMeta>) {
        let state = self.state.read();
        let owner = unsafe { meta.as_ref() };
        slot.store(Binding::new(owner.payload(), Some(meta)));
        owner.finish_construction();
        self.on_pointee_changed(&state, slot);
    }

    /// Binds `slot` to `addr`, tracked if an allocation accepted by `accept`
    /// contains it.
    pub(crate) fn bind_raw(
        &self,
        slot: &PtrBase,
        addr: *mut u8,
        accept: impl FnOnce(&ObjMeta) -> bool,
    ) {
        let state = self.state.read();
        let meta = if addr.is_null() {
            None
        } else {
            state
                .find_owner(addr as usize)
                .filter(|meta| accept(unsafe { meta.as_ref() }))
        };
        slot.store(Binding::new(addr, meta));
        self.on_pointee_changed(&state, slot);
    }

    fn on_pointee_changed(&self, state: &CollectorState, slot: &PtrBase) {
        let meta = match slot.meta() {
            Some(meta) => unsafe { &*meta.as_ptr() },
            None => return,
        };
        match state.phase {
            Phase::RootMarking => {
                if slot.index() < state.next_root_marking {
                    self.try_mark_root(slot);
                }
            }
            // Shade whatever is stored during marking, also into interior
            // handles: the holder may already be Alive.
            Phase::ChildMarking => self.mark_target(slot),
            Phase::Sweeping => {
                if meta.mark_state() != MarkColor::Unmarked {
                    return;
                }
                match state.next_sweeping {
                    Some(cursor) if meta.payload_addr() >= cursor => {
                        meta.set_mark_state(MarkColor::Alive)
                    }
                    // Already passed by the sweep cursor.
                    _ => log::trace!("{:?} already decided this cycle", meta),
                }
            }
        }
    }

    fn try_mark_root(&self, slot: &PtrBase) {
        if slot.is_root() {
            self.mark_target(slot);
        }
    }

    fn mark_target(&self, slot: &PtrBase) {
        if let Some(meta) = slot.meta() {
            if unsafe { meta.as_ref() }.try_shade() {
                self.gray.lock().push(MetaRef(meta));
            }
        }
    }

    /// Demotes `slot` when its home lies inside a tracked payload.
    fn resolve_owner(&self, state: &CollectorState, slot: &PtrBase) {
        if !slot.is_root() {
            return;
        }
        let home = slot.home();
        if home == 0 {
            return;
        }
        if let Some(owner) = state.find_owner(home) {
            slot.demote();
            let owner = unsafe { owner.as_ref() };
            owner.class_info().register_offset(owner, home as *const u8);
        }
    }

    /// Advances the collection state machine by at most `step_budget` units
    /// and returns the number of objects destroyed by this call.
    ///
    /// One unit is one handle visited, one gray object traced or one meta
    /// swept. Phase transitions are free and chain into the next phase with
    /// the remaining budget; a call wraps past the end of a sweep at most once.
    pub fn collect(&self, step_budget: usize) -> usize {
        if step_budget == 0 {
            return 0;
        }
        let mut budget = step_budget;
        let mut dead = Vec::new();
        {
            let mut state = self.state.write();
            if state.phase == Phase::RootMarking && state.metas.is_empty() {
                return 0;
            }
            let mut wrapped = false;
            loop {
                match state.phase {
                    Phase::RootMarking => {
                        while budget > 0 && state.next_root_marking < state.pointers.len() {
                            let slot = state.pointers[state.next_root_marking];
                            state.next_root_marking += 1;
                            budget -= 1;
                            self.resolve_owner(&state, slot.get());
                            self.try_mark_root(slot.get());
                        }
                        if state.next_root_marking < state.pointers.len() {
                            break;
                        }
                        log::trace!("visited {} handle(s)", state.pointers.len());
                        state.next_root_marking = 0;
                        state.phase = Phase::ChildMarking;
                    }
                    Phase::ChildMarking => {
                        if !self.mark_children(&mut budget) {
                            break;
                        }
                        state.phase = Phase::Sweeping;
                        state.next_sweeping = state.metas.keys().next().copied();
                        state.swept_this_cycle = 0;
                        log::trace!("marking done, sweeping {} object(s)", state.metas.len());
                    }
                    Phase::Sweeping => {
                        let before = dead.len();
                        self.sweep(&mut state, &mut budget, &mut dead);
                        state.swept_this_cycle += dead.len() - before;
                        if state.next_sweeping.is_some() {
                            break;
                        }
                        state.phase = Phase::RootMarking;
                        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
                        logln_if!(
                            self.config.verbose,
                            "[tgc] cycle {} done: swept {}, {} object(s) and {} handle(s) left",
                            cycle,
                            state.swept_this_cycle,
                            state.metas.len(),
                            state.pointers.len()
                        );
                        if wrapped || state.metas.is_empty() {
                            break;
                        }
                        wrapped = true;
                    }
                }
            }
        }

        let swept = dead.len();
        if swept > 0 {
            self.total_swept.fetch_add(swept, Ordering::Relaxed);
            // Destructors drop embedded handles and may re-enter the collector.
            unsafe { release(dead) };
        }
        swept
    }

    /// Traces gray objects. Returns true once the gray queue is empty.
    fn mark_children(&self, budget: &mut usize) -> bool {
        let mut gray = self.gray.lock();
        while *budget > 0 {
            let meta = match gray.pop() {
                Some(meta) => meta,
                None => break,
            };
            *budget -= 1;
            let meta = meta.get();
            meta.set_mark_state(MarkColor::Alive);
            if meta.is_constructing() {
                continue;
            }
            let offsets = meta.class_info().offsets();
            for index in 0..meta.count() {
                let base = meta.element(index);
                for &offset in offsets {
                    let child = unsafe { PtrBase::from_field(base.add(offset)) };
                    if let Some(target) = child.meta() {
                        if unsafe { target.as_ref() }.try_shade() {
                            gray.push(MetaRef(target));
                        }
                    }
                }
            }
        }
        gray.is_empty()
    }

    fn sweep(&self, state: &mut CollectorState, budget: &mut usize, dead: &mut Vec<MetaRef>) {
        while *budget > 0 {
            let key = match state.next_sweeping {
                Some(key) => key,
                None => break,
            };
            *budget -= 1;
            state.next_sweeping = state.meta_after(key);
            let meta = match state.metas.get(&key) {
                Some(meta) => *meta,
                None => continue,
            };
            let m = meta.get();
            if m.is_constructing() {
                continue;
            }
            match m.mark_state() {
                MarkColor::Unmarked => {
                    state.metas.remove(&key);
                    dead.push(meta);
                }
                MarkColor::Gray | MarkColor::Alive => m.set_mark_state(MarkColor::Unmarked),
            }
        }
    }

    /// Runs collection until the current cycle completes. Returns the number
    /// of objects destroyed.
    pub fn full_cycle(&self) -> usize {
        let start = self.cycles();
        let mut swept = 0;
        loop {
            swept += self.collect(usize::MAX);
            if self.cycles() != start || self.is_idle() {
                return swept;
            }
        }
    }

    /// Collects until nothing is left or a full cycle frees nothing, then
    /// releases every remaining allocation and unbinds every remaining handle.
    ///
    /// Allocations still under construction on other threads are kept.
    pub fn teardown(&self) -> usize {
        let mut released = 0;
        while !self.is_idle() {
            let swept = self.full_cycle();
            released += swept;
            if swept == 0 {
                break;
            }
        }

        let (dead, unbound) = {
            let mut state = self.state.write();
            let mut dead = Vec::new();
            state.metas.retain(|_, meta| {
                if meta.get().is_constructing() {
                    true
                } else {
                    dead.push(*meta);
                    false
                }
            });
            for slot in state.pointers.iter() {
                slot.get().store(Binding::EMPTY);
            }
            state.phase = Phase::RootMarking;
            state.next_root_marking = 0;
            state.next_sweeping = None;
            self.gray.lock().clear();
            (dead, state.pointers.len())
        };

        let forced = dead.len();
        unsafe { release(dead) };
        log::info!(
            "[tgc] teardown: {} object(s) collected, {} released, {} handle(s) unbound",
            released,
            forced,
            unbound
        );
        released + forced
    }

    pub fn statistics(&self) -> HeapStatistics {
        let state = self.state.read();
        let gray_objects = self.gray.lock().len();
        let (live_objects, live_bytes) = state
            .metas
            .values()
            .map(MetaRef::get)
            .filter(|meta| !meta.is_constructing())
            .fold((0, 0), |(count, bytes), meta| {
                (count + meta.count(), bytes + meta.allocation_size())
            });
        HeapStatistics {
            handles: state.pointers.len(),
            metas: state.metas.len(),
            gray_objects,
            live_objects,
            live_bytes,
            phase: state.phase,
            total_gc_cycles_count: self.cycles(),
            total_objects_swept: self.total_swept.load(Ordering::Relaxed),
            total_objects_allocated: self.total_allocated.load(Ordering::Relaxed),
        }
    }

    /// Every registered slot records its own table index.
    #[cfg(test)]
    pub(crate) fn handle_table_is_consistent(&self) -> bool {
        let state = self.state.read();
        state
            .pointers
            .iter()
            .enumerate()
            .all(|(index, slot)| slot.get().index() == index)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // No handle can exist anymore, each slot keeps the collector alive.
        let metas = std::mem::take(&mut self.state.get_mut().metas);
        if !metas.is_empty() {
            log::debug!("[tgc] releasing {} object(s) on drop", metas.len());
            unsafe { release(metas.into_values().collect()) };
        }
    }
}

/// Finalizes every object first, then frees the storage, so destructors may
/// still read other dead objects.
unsafe fn release(dead: Vec<MetaRef>) {
    for meta in dead.iter() {
        let meta = meta.get();
        meta.finalize(meta.count());
    }
    for meta in dead {
        ObjMeta::free(meta.0);
    }
}
