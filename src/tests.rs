use std::{
    mem::offset_of,
    panic::{catch_unwind, AssertUnwindSafe},
    ptr::null,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    collector::Phase, gcref::Gc, header::MarkColor, heap::Heap,
    internal::construction_scope::ConstructionScope, visitor::Visitor, Trace,
};

struct Node {
    next: Gc<Node>,
    drops: Arc<AtomicUsize>,
}

unsafe impl Trace for Node {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_handle(&self.next);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn node(heap: &Heap, drops: &Arc<AtomicUsize>) -> Gc<Node> {
    heap.allocate(Node {
        next: heap.empty(),
        drops: drops.clone(),
    })
}

struct Counted(Arc<AtomicUsize>);

unsafe impl Trace for Counted {}

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn collect_until(heap: &Heap, budget: usize, mut done: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        heap.collect(budget);
    }
    panic!("collection did not converge: {}", heap.statistics());
}

fn drops() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn mutual_cycle_is_reclaimed() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let a = node(&heap, &dropped);
    let b = node(&heap, &dropped);
    a.next.set(&b);
    b.next.set(&a);
    drop((a, b));

    collect_until(&heap, 3, || heap.statistics().metas == 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 2);

    for _ in 0..10 {
        heap.collect(3);
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert!(heap.collector().handle_table_is_consistent());
    assert_eq!(heap.statistics().handles, 0);
}

#[test]
fn self_cycle_is_reclaimed() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let a = node(&heap, &dropped);
    a.next.set(&a);
    drop(a);

    collect_until(&heap, 1, || dropped.load(Ordering::SeqCst) == 1);
    assert_eq!(heap.statistics().metas, 0);
}

#[test]
fn rooted_object_survives_until_its_root_is_reset() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let a = node(&heap, &dropped);
    let r = a.clone();
    drop(a);

    for _ in 0..5 {
        heap.full_collect();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert_eq!(r.drops.load(Ordering::SeqCst), 0);

    // Stop mid-cycle before resetting.
    heap.collect(1);
    r.reset();
    let start = heap.statistics().total_gc_cycles_count;
    collect_until(&heap, 2, || dropped.load(Ordering::SeqCst) == 1);
    assert!(heap.statistics().total_gc_cycles_count - start <= 2);
}

#[test]
fn array_elements_are_destroyed_exactly_once() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let array = heap.allocate_array(17, |_| Counted(dropped.clone()));
    assert_eq!(array.elements().len(), 17);
    drop(array);

    collect_until(&heap, 1, || heap.statistics().metas == 0);
    for _ in 0..8 {
        heap.collect(1);
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 17);
}

#[test]
fn array_elements_trace_their_own_handles() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let ring = heap.allocate_array(4, |_| Node {
        next: heap.empty(),
        drops: dropped.clone(),
    });
    let extra = node(&heap, &dropped);
    ring.elements()[3].next.set(&extra);
    drop(extra);

    for (index, element) in ring.elements().iter().enumerate() {
        if index < 3 {
            let next = Gc::from_ref(&heap, &ring.elements()[index + 1]).unwrap();
            element.next.set(&next);
        }
    }

    for _ in 0..3 {
        heap.full_collect();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert!(ring.elements().iter().all(|element| !element.next.is_root()));

    drop(ring);
    collect_until(&heap, 4, || heap.statistics().metas == 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 5);
}

#[test]
fn collect_without_budget_or_objects_is_a_no_op() {
    let heap = Heap::with_defaults();
    assert_eq!(heap.collect(100), 0);
    assert_eq!(heap.phase(), Phase::RootMarking);
    assert_eq!(heap.statistics().total_gc_cycles_count, 0);

    let dropped = drops();
    let a = node(&heap, &dropped);
    drop(a);
    let before = heap.statistics();
    assert_eq!(heap.collect(0), 0);
    assert_eq!(heap.statistics(), before);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
}

struct Pair {
    left: Gc<u32>,
    tag: u64,
    right: Gc<u32>,
}

unsafe impl Trace for Pair {
    fn trace(&self, vis: &mut Visitor<'_>) {
        // Deliberately not in declaration order.
        vis.trace_handle(&self.right);
        vis.trace_handle(&self.left);
    }
}

#[test]
fn handle_offsets_follow_the_field_layout() {
    let heap = Heap::with_defaults();
    let first = heap.allocate(Pair {
        left: heap.allocate(1),
        tag: 7,
        right: heap.allocate(2),
    });
    let second = heap.allocate(Pair {
        left: heap.empty(),
        tag: 8,
        right: heap.allocate(3),
    });

    let mut expected = vec![offset_of!(Pair, left), offset_of!(Pair, right)];
    expected.sort_unstable();

    let class = first.meta_ref().unwrap().class_info();
    assert!(class.is_registered());
    assert_eq!(class.offsets(), expected.as_slice());
    assert!(std::ptr::eq(class, second.meta_ref().unwrap().class_info()));

    drop(first);
    heap.full_collect();
    heap.full_collect();
    assert_eq!(*second.right, 3);
    assert_eq!(second.tag, 8);
    assert_eq!(heap.statistics().metas, 2);
}

#[test]
fn dropping_a_handle_keeps_the_table_consistent() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let mut fillers: Vec<Gc<Node>> = (0..10).map(|_| heap.empty()).collect();
    let obj = node(&heap, &dropped);
    let late = obj.clone();
    drop(obj);
    assert!(heap.collector().handle_table_is_consistent());

    // Visit the first five handles, then move the unvisited `late` into the
    // visited region by dropping a visited filler.
    heap.collect(5);
    assert_eq!(heap.phase(), Phase::RootMarking);
    fillers.swap_remove(2);
    assert!(heap.collector().handle_table_is_consistent());

    let start = heap.statistics().total_gc_cycles_count;
    collect_until(&heap, 5, || heap.statistics().total_gc_cycles_count > start);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);

    while let Some(filler) = fillers.pop() {
        drop(filler);
        assert!(heap.collector().handle_table_is_consistent());
    }
    for _ in 0..3 {
        heap.full_collect();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert_eq!(late.drops.load(Ordering::SeqCst), 0);
}

struct Tracked {
    next: Gc<Tracked>,
    value: usize,
    freed: Arc<AtomicBool>,
}

unsafe impl Trace for Tracked {
    fn trace(&self, vis: &mut Visitor<'_>) {
        vis.trace_handle(&self.next);
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.freed.store(true, Ordering::SeqCst);
    }
}

fn mutate_lists(heap: &Heap, rounds: usize) {
    let head: Gc<Tracked> = heap.empty();
    let mut flags = Vec::new();
    for round in 0..rounds {
        let flag = Arc::new(AtomicBool::new(false));
        let node = heap.allocate(Tracked {
            next: heap.empty(),
            value: round,
            freed: flag.clone(),
        });
        node.next.set(&head);
        head.set(&node);
        drop(node);
        flags.push(flag);

        if round % 16 == 15 {
            assert!(flags.iter().all(|flag| !flag.load(Ordering::SeqCst)));
            let mut cursor = head.clone();
            let mut expected = round;
            let mut length = 0;
            while !cursor.is_empty() {
                assert_eq!(cursor.value, expected);
                let next = cursor.next.clone();
                cursor = next;
                expected = expected.wrapping_sub(1);
                length += 1;
            }
            assert_eq!(length, 16);
            head.reset();
            flags.clear();
        }
    }
}

#[test]
fn concurrent_mutation_never_loses_reachable_objects() {
    let heap = Heap::with_defaults();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let collector = s.spawn(|| {
            let mut swept = 0;
            while !stop.load(Ordering::SeqCst) {
                swept += heap.collect(7);
            }
            swept
        });
        let mutators: Vec<_> = (0..4)
            .map(|_| s.spawn(|| mutate_lists(&heap, 512)))
            .collect();
        for mutator in mutators {
            mutator.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        collector.join().unwrap();
    });

    collect_until(&heap, 64, || heap.statistics().metas == 0);
    assert_eq!(heap.statistics().total_objects_allocated, 4 * 512);
    assert!(heap.collector().handle_table_is_consistent());
}

#[test]
fn objects_allocated_while_sweeping_survive() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    for _ in 0..64 {
        drop(node(&heap, &dropped));
    }
    let keep = node(&heap, &dropped);
    collect_until(&heap, 1, || heap.phase() == Phase::Sweeping);

    let fresh = node(&heap, &dropped);
    let child = node(&heap, &dropped);
    keep.next.set(&child);
    drop(child);

    let start = heap.statistics().total_gc_cycles_count;
    collect_until(&heap, 3, || heap.statistics().total_gc_cycles_count >= start + 3);
    assert_eq!(dropped.load(Ordering::SeqCst), 64);
    assert_eq!(heap.statistics().metas, 3);
    assert!(fresh.is_tracked());
    assert!(keep.next.is_tracked());

    keep.next.reset();
    collect_until(&heap, 3, || dropped.load(Ordering::SeqCst) == 65);
    assert_eq!(heap.statistics().metas, 2);
}

#[test]
fn raw_pointers_bind_to_their_owner() {
    let heap = Heap::with_defaults();
    let array = heap.allocate_array(3, |i| i as u64 * 10);
    let third = Gc::from_ref(&heap, &array.elements()[2]).unwrap();
    assert_eq!(*third, 20);
    assert_eq!(third, array);
    assert!(!Gc::ptr_eq(&third, &array));
    assert_eq!(third.elements(), &[20]);

    let local = 5u64;
    assert!(Gc::from_ref(&heap, &local).is_none());
    let untracked = unsafe { Gc::from_raw(&heap, &local) };
    assert!(!untracked.is_tracked());
    assert_eq!(*untracked, 5);
    assert_eq!(untracked.elements(), &[5]);

    let wrong_type = unsafe { Gc::<u32>::from_raw(&heap, array.as_ptr().cast::<u32>()) };
    assert!(!wrong_type.is_tracked());
    let misaligned = unsafe {
        Gc::<u64>::from_raw(&heap, array.as_ptr().cast::<u8>().add(4).cast::<u64>())
    };
    assert!(!misaligned.is_tracked());
    let null = unsafe { Gc::<u64>::from_raw(&heap, null()) };
    assert!(null.is_empty());

    drop(array);
    heap.full_collect();
    heap.full_collect();
    assert_eq!(*third, 20);
    assert_eq!(heap.statistics().metas, 1);

    drop(third);
    collect_until(&heap, 2, || heap.statistics().metas == 0);
}

#[test]
fn teardown_releases_everything_and_unbinds_handles() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let a = node(&heap, &dropped);
    let array = heap.allocate_array(2, |_| Counted(dropped.clone()));

    assert_eq!(heap.teardown(), 2);
    assert_eq!(dropped.load(Ordering::SeqCst), 3);
    assert!(a.is_empty());
    assert!(!a.is_tracked());
    assert!(array.elements().is_empty());
    assert_eq!(heap.statistics().metas, 0);

    let survivor = {
        let heap = Heap::with_defaults();
        heap.allocate(3u32)
    };
    assert!(survivor.is_empty());
}

#[test]
fn nested_allocation_completes_inner_objects_first() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let outer = heap.allocate_array(3, |_| {
        assert_eq!(ConstructionScope::depth(), 1);
        Node {
            next: node(&heap, &dropped),
            drops: dropped.clone(),
        }
    });
    assert_eq!(ConstructionScope::depth(), 0);
    assert_eq!(heap.statistics().metas, 4);

    heap.full_collect();
    heap.full_collect();
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert!(outer.elements().iter().all(|element| !element.next.is_root()));

    drop(outer);
    collect_until(&heap, 5, || heap.statistics().metas == 0);
    assert_eq!(dropped.load(Ordering::SeqCst), 6);
}

#[test]
fn panicking_initializer_releases_the_allocation() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let result = catch_unwind(AssertUnwindSafe(|| {
        heap.allocate_array(5, |i| {
            if i == 3 {
                panic!("initializer failed");
            }
            Counted(dropped.clone())
        })
    }));
    assert!(result.is_err());
    assert_eq!(dropped.load(Ordering::SeqCst), 3);
    assert_eq!(heap.statistics().metas, 0);
    assert_eq!(ConstructionScope::depth(), 0);
    assert!(heap.collector().handle_table_is_consistent());
}

#[test]
fn interior_handles_keep_their_targets_alive() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let parent = node(&heap, &dropped);
    let child = node(&heap, &dropped);
    parent.next.set(&child);
    drop(child);

    for _ in 0..4 {
        heap.full_collect();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert!(!parent.next.is_root());

    let taken = parent.next.take();
    assert!(parent.next.is_empty());
    parent.next.swap(&taken);
    assert!(taken.is_empty());
    assert!(parent.next.is_tracked());

    parent.next.reset();
    collect_until(&heap, 2, || dropped.load(Ordering::SeqCst) == 1);
    assert!(parent.is_tracked());
}

#[test]
fn global_heap_allocates_and_collects() {
    let value = crate::allocate(7u32);
    assert_eq!(*value, 7);
    let array = crate::allocate_array(4, |i| i as u32);
    assert_eq!(array.elements(), &[0, 1, 2, 3]);
    crate::collect(16);
    assert!(crate::global::statistics().metas >= 2);
    assert_eq!(*value, 7);
}

fn mark_of<T>(handle: &Gc<T>) -> MarkColor {
    handle.meta_ref().unwrap().mark_state()
}

#[test]
fn redirecting_into_a_traced_object_shades_the_new_target() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let children = [drops(), drops()];
    let roots = [node(&heap, &dropped), node(&heap, &dropped)];
    for (root, child_drops) in roots.iter().zip(&children) {
        let holder = node(&heap, &dropped);
        holder.next.set(&node(&heap, child_drops));
        root.next.set(&holder);
    }

    // Stop right after the first root is traced, before the other chain is.
    let mut traced = 0;
    collect_until(&heap, 1, || {
        if heap.phase() != Phase::ChildMarking {
            return false;
        }
        match roots.iter().position(|root| mark_of(root) == MarkColor::Alive) {
            Some(index) => {
                traced = index;
                mark_of(&roots[1 - index].next) == MarkColor::Unmarked
            }
            None => false,
        }
    });

    // Move the only path to the untraced child into the traced root.
    let (parent, other) = (&roots[traced], &roots[1 - traced]);
    parent.next.set(&other.next.next);
    other.next.next.reset();

    for _ in 0..4 {
        heap.full_collect();
    }
    assert_eq!(children[1 - traced].load(Ordering::SeqCst), 0);
    assert!(parent.next.is_tracked());
    // The holder the parent let go of goes with its child.
    assert_eq!(children[traced].load(Ordering::SeqCst), 1);
    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(heap.statistics().metas, 4);
}

#[test]
fn objects_behind_the_sweep_cursor_are_not_resurrected() {
    let heap = Heap::with_defaults();
    let dropped = drops();
    let mut objects: Vec<Gc<Node>> = (0..32).map(|_| node(&heap, &dropped)).collect();

    let mut passed = None;
    collect_until(&heap, 1, || {
        if heap.phase() != Phase::Sweeping {
            return false;
        }
        passed = objects
            .iter()
            .position(|object| mark_of(object) == MarkColor::Unmarked);
        passed.is_some()
    });
    let passed = objects.swap_remove(passed.unwrap());

    let late: Gc<Node> = heap.empty();
    late.set(&passed);
    assert_eq!(mark_of(&late), MarkColor::Unmarked);
    drop(passed);
    drop(objects);

    let start = heap.statistics().total_gc_cycles_count;
    collect_until(&heap, 1, || heap.statistics().total_gc_cycles_count > start);
    assert!(late.is_tracked());

    for _ in 0..3 {
        heap.full_collect();
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 31);
    assert_eq!(heap.statistics().metas, 1);
    assert_eq!(late.drops.load(Ordering::SeqCst), 31);
}

#[test]
fn copies_of_a_shared_handle_keep_target_and_owner_together() {
    let heap = Heap::with_defaults();
    let a = heap.allocate(1u64);
    let b = heap.allocate(2u64);
    let shared: Gc<u64> = heap.empty();
    let stop = AtomicBool::new(false);

    let torn = std::thread::scope(|s| {
        for source in [&a, &b] {
            let (shared, stop) = (&shared, &stop);
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    shared.set(source);
                }
            });
        }
        s.spawn(|| {
            while !stop.load(Ordering::Relaxed) {
                heap.collect(5);
            }
        });

        let dest: Gc<u64> = heap.empty();
        let mut torn = 0;
        for _ in 0..200_000 {
            dest.set(&shared);
            if let Some(owner) = dest.meta_ref() {
                if owner.payload_addr() != dest.as_ptr() as usize {
                    torn += 1;
                }
                assert!(*dest == 1 || *dest == 2);
            }
        }
        stop.store(true, Ordering::Relaxed);
        torn
    });

    assert_eq!(torn, 0);
    assert_eq!(*a, 1);
    assert_eq!(*b, 2);
}
