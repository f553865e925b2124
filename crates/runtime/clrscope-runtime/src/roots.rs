//! GC root enumeration.
//!
//! Four independent root categories: the GC handle table, static and
//! thread-static field slots, live-thread stack slots, and the finalizer
//! queue. Each category is scanned on its own and a failure inside one
//! (unreadable slot, unresolvable target) never suppresses the others;
//! partial root sets are the normal output for a truncated dump.
//!
//! A root is only reported if its target resolves to a known type; a slot
//! pointing at recycled or unreadable memory is dropped with a `debug!`
//! trace rather than surfaced as an untyped address.

use clrscope_core::{
    Addr, CancelToken, ClrHandle, FinalizerQueueSegment, HandleKind, HandleSource, MemoryExt,
    Result, StaticRootSource, ThreadSource,
};
use clrscope_heap::{ClrHeap, ClrType};
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Where a root was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Async-pinned handle (overlapped I/O), including its expanded
    /// user-object contents.
    AsyncPinnedHandle,
    /// Pinning handle.
    PinnedHandle,
    /// Plain strong handle.
    StrongHandle,
    /// Ref-counted handle with a nonzero count.
    RefCountHandle,
    /// Sized-ref handle.
    SizedRefHandle,
    /// Static field slot.
    StaticVar,
    /// Thread-static field slot.
    ThreadStaticVar,
    /// Live-thread stack slot.
    Stack,
    /// Finalizer-queue entry whose finalizer has not yet run.
    Finalizer,
}

/// One GC root: a location outside the heap keeping an object alive.
#[derive(Debug, Clone)]
pub struct ClrRoot {
    /// Address of the slot holding the reference (handle, static slot,
    /// stack slot, or queue entry).
    pub address: Addr,
    /// The rooted object.
    pub object: Addr,
    /// Category the root came from.
    pub kind: RootKind,
    /// Resolved type of the rooted object.
    pub ty: Arc<ClrType>,
    /// Whether the root pins its target against relocation.
    pub pinned: bool,
    /// Whether `object` points into the interior of its target.
    pub interior: bool,
    /// Owning domain, where the category records one.
    pub domain: Option<u32>,
    /// Owning thread, for stack and thread-static roots.
    pub thread: Option<u32>,
}

/// Enumeration order within the handle-table category. Pinning kinds come
/// first so consumers that stop early still see everything immovable.
fn handle_order(kind: HandleKind) -> u32 {
    match kind {
        HandleKind::AsyncPinned => 0,
        HandleKind::Pinned => 1,
        HandleKind::Strong => 2,
        HandleKind::RefCount => 3,
        _ => 4,
    }
}

fn root_kind(kind: HandleKind) -> RootKind {
    match kind {
        HandleKind::AsyncPinned => RootKind::AsyncPinnedHandle,
        HandleKind::Pinned => RootKind::PinnedHandle,
        HandleKind::RefCount => RootKind::RefCountHandle,
        HandleKind::SizedRef => RootKind::SizedRefHandle,
        _ => RootKind::StrongHandle,
    }
}

fn resolve(heap: &ClrHeap, object: Addr) -> Option<Arc<ClrType>> {
    let ty = heap.object_type_at(object);
    if ty.is_none() {
        debug!("dropping root target {object:#x}: type does not resolve");
    }
    ty
}

/// Scan the handle table for strong roots.
///
/// Weak and dependent handles never root; ref-counted handles root only
/// while their count is nonzero. Async-pinned handles additionally report
/// what their target's user-object field pins: element-wise for object
/// arrays, as a whole otherwise.
pub(crate) fn handle_roots(
    heap: &ClrHeap,
    source: &dyn HandleSource,
    cancel: &CancelToken,
) -> Result<Vec<ClrRoot>> {
    let mut handles: Vec<ClrHandle> = source
        .handles()
        .into_iter()
        .filter(|h| h.object != 0 && h.kind.is_strong())
        .filter(|h| h.kind != HandleKind::RefCount || h.ref_count > 0)
        .collect();
    handles.sort_by_key(|h| handle_order(h.kind));

    let mut roots = Vec::new();
    for handle in handles {
        cancel.check()?;
        let Some(ty) = resolve(heap, handle.object) else {
            continue;
        };
        let pinned = matches!(handle.kind, HandleKind::Pinned | HandleKind::AsyncPinned);
        roots.push(ClrRoot {
            address: handle.address,
            object: handle.object,
            kind: root_kind(handle.kind),
            ty,
            pinned,
            interior: false,
            domain: Some(handle.domain),
            thread: None,
        });
        if handle.kind == HandleKind::AsyncPinned {
            expand_async_pinned(heap, handle.object, handle.domain, &mut roots);
        }
    }
    Ok(roots)
}

/// Report what an async-pinned handle's target actually pins: the object
/// stored in its user-object field, or that array's elements when the
/// field holds an object array.
fn expand_async_pinned(heap: &ClrHeap, target: Addr, domain: u32, roots: &mut Vec<ClrRoot>) {
    let mem = heap.memory();
    let word = heap.pointer_size();
    let user_slot = target + heap.abi().async_pinned_user_object_offset(word);
    let Some(user_obj) = mem.read_ptr(user_slot).filter(|&o| o != 0) else {
        return;
    };
    let Some(user_ty) = resolve(heap, user_obj) else {
        return;
    };

    if user_ty.is_object_array() {
        let Some(len) = heap.array_length(user_obj) else {
            return;
        };
        let data = heap.array_data_address(user_obj);
        for i in 0..u64::from(len) {
            let slot = data + i * u64::from(word);
            let Some(element) = mem.read_ptr(slot).filter(|&o| o != 0) else {
                continue;
            };
            let Some(ty) = resolve(heap, element) else {
                continue;
            };
            roots.push(ClrRoot {
                address: slot,
                object: element,
                kind: RootKind::AsyncPinnedHandle,
                ty,
                pinned: true,
                interior: false,
                domain: Some(domain),
                thread: None,
            });
        }
    } else {
        roots.push(ClrRoot {
            address: user_slot,
            object: user_obj,
            kind: RootKind::AsyncPinnedHandle,
            ty: user_ty,
            pinned: true,
            interior: false,
            domain: Some(domain),
            thread: None,
        });
    }
}

/// Scan static and thread-static field slots.
///
/// Each slot read is independently failable: an unreadable slot is logged
/// and skipped, never fatal.
pub(crate) fn static_roots(
    heap: &ClrHeap,
    source: &dyn StaticRootSource,
    cancel: &CancelToken,
) -> Result<Vec<ClrRoot>> {
    let mut roots = Vec::new();
    for slot in source.static_slots() {
        cancel.check()?;
        let Some(object) = heap.memory().read_ptr(slot.address) else {
            debug!("static slot {:#x} ({}) unreadable", slot.address, slot.name);
            continue;
        };
        if object == 0 {
            continue;
        }
        let Some(ty) = resolve(heap, object) else {
            continue;
        };
        roots.push(ClrRoot {
            address: slot.address,
            object,
            kind: if slot.thread.is_some() {
                RootKind::ThreadStaticVar
            } else {
                RootKind::StaticVar
            },
            ty,
            pinned: false,
            interior: false,
            domain: Some(slot.domain),
            thread: slot.thread,
        });
    }
    Ok(roots)
}

/// Scan the stacks of live threads.
///
/// Dead threads contribute nothing. When the target's stack-reference
/// tables are conservative rather than exact, the same object surfaces
/// many times per thread and is de-duplicated.
pub(crate) fn stack_roots(
    heap: &ClrHeap,
    source: &dyn ThreadSource,
    cancel: &CancelToken,
) -> Result<Vec<ClrRoot>> {
    let exact = source.exact_stack_walk();
    let mut roots = Vec::new();
    for thread in source.threads() {
        cancel.check()?;
        if !thread.alive {
            continue;
        }
        let mut seen = FxHashSet::default();
        for stack_ref in source.stack_refs(thread.id) {
            if stack_ref.object == 0 {
                continue;
            }
            if !exact && !seen.insert(stack_ref.object) {
                continue;
            }
            let Some(ty) = resolve(heap, stack_ref.object) else {
                continue;
            };
            roots.push(ClrRoot {
                address: stack_ref.address,
                object: stack_ref.object,
                kind: RootKind::Stack,
                ty,
                pinned: stack_ref.pinned,
                interior: stack_ref.interior,
                domain: None,
                thread: Some(thread.id),
            });
        }
    }
    Ok(roots)
}

/// Scan finalizer-queue segments: raw arrays of object pointers, one root
/// per readable non-null slot.
pub(crate) fn finalizer_roots(
    heap: &ClrHeap,
    segments: &[FinalizerQueueSegment],
    cancel: &CancelToken,
) -> Result<Vec<ClrRoot>> {
    let mut roots = Vec::new();
    for addr in finalizer_queue_objects(heap, segments) {
        cancel.check()?;
        let Some(ty) = resolve(heap, addr) else {
            continue;
        };
        roots.push(ClrRoot {
            // The queue slot address is not preserved past the scan; the
            // object address doubles as the root location.
            address: addr,
            object: addr,
            kind: RootKind::Finalizer,
            ty,
            pinned: false,
            interior: false,
            domain: None,
            thread: None,
        });
    }
    Ok(roots)
}

/// Raw object addresses stored in finalizer-queue segments, null slots
/// skipped, unreadable slots ending that segment.
pub(crate) fn finalizer_queue_objects(
    heap: &ClrHeap,
    segments: &[FinalizerQueueSegment],
) -> Vec<Addr> {
    let word = u64::from(heap.pointer_size());
    let mem = heap.memory();
    let mut objects = Vec::new();
    for seg in segments {
        let mut slot = seg.start;
        while slot < seg.end {
            match mem.read_ptr(slot) {
                Some(0) => {}
                Some(addr) => objects.push(addr),
                None => {
                    debug!("finalizer queue truncated at {slot:#x}");
                    break;
                }
            }
            slot += word;
        }
    }
    objects
}

/// Collect dependent handles into a primary → secondaries map.
///
/// Dependent handles do not root; they add edges. The map is consulted as
/// a second reference source when enumerating an object's outgoing
/// references.
pub(crate) fn dependent_handle_map(
    source: &dyn HandleSource,
    cancel: &CancelToken,
) -> Result<FxHashMap<Addr, Vec<Addr>>> {
    let mut map: FxHashMap<Addr, Vec<Addr>> = FxHashMap::default();
    for handle in source.handles() {
        cancel.check()?;
        if handle.kind == HandleKind::Dependent
            && handle.object != 0
            && handle.dependent_target != 0
        {
            map.entry(handle.object).or_default().push(handle.dependent_target);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrscope_core::{
        DesktopAbi, MemorySource, RuntimeAbi, RuntimeVersion, SegmentData, SessionConfig,
        StaticFieldSlot, StackRef, ThreadInfo,
    };
    use clrscope_heap::testing::{MtSpec, TargetBuilder, TestProvider};
    use clrscope_heap::TypeFactory;

    const MT_PLAIN: Addr = 0x10_0000;
    const MT_OBJ_ARRAY: Addr = 0x10_1000;
    const SEG: Addr = 0x20_0000;

    struct FakeHandles(Vec<ClrHandle>);
    impl HandleSource for FakeHandles {
        fn handles(&self) -> Vec<ClrHandle> {
            self.0.clone()
        }
    }

    struct FakeStatics(Vec<StaticFieldSlot>);
    impl StaticRootSource for FakeStatics {
        fn static_slots(&self) -> Vec<StaticFieldSlot> {
            self.0.clone()
        }
    }

    struct FakeThreads {
        threads: Vec<ThreadInfo>,
        refs: FxHashMap<u32, Vec<StackRef>>,
        exact: bool,
    }
    impl ThreadSource for FakeThreads {
        fn threads(&self) -> Vec<ThreadInfo> {
            self.threads.clone()
        }
        fn stack_refs(&self, thread_id: u32) -> Vec<StackRef> {
            self.refs.get(&thread_id).cloned().unwrap_or_default()
        }
        fn exact_stack_walk(&self) -> bool {
            self.exact
        }
    }

    fn handle(address: Addr, object: Addr, kind: HandleKind) -> ClrHandle {
        ClrHandle {
            address,
            object,
            kind,
            ref_count: 0,
            dependent_target: 0,
            domain: 0,
        }
    }

    fn test_heap(extra: impl FnOnce(&mut TargetBuilder)) -> ClrHeap {
        let mut target = TargetBuilder::new(8);
        target.method_table(MT_PLAIN, MtSpec::default());
        target.method_table(
            MT_OBJ_ARRAY,
            MtSpec {
                base_size: 24,
                component_size: 8,
                component_kind: 1,
                token: 0x0200_0005,
                ..MtSpec::default()
            },
        );
        // A few plain objects the roots can point at.
        for i in 0..4u64 {
            target.object(SEG + i * 24, MT_PLAIN);
        }
        target.map_range(SEG, SEG + 4 * 24);
        extra(&mut target);

        let mem: Arc<dyn MemorySource> = Arc::new(target.finish());
        let abi: Arc<dyn RuntimeAbi> = Arc::new(
            DesktopAbi::new(RuntimeVersion {
                major: 4,
                minor: 8,
                build: 0,
                revision: 0,
            })
            .unwrap(),
        );
        let types = Arc::new(TypeFactory::new(mem.clone(), abi.clone()));
        let provider = TestProvider {
            segments: vec![SegmentData {
                start: SEG,
                first_object: SEG,
                committed_end: SEG + 4 * 24,
                end: SEG + 4 * 24,
                large: false,
            }],
            free_mt: 0,
            string_mt: 0,
            object_mt: MT_PLAIN,
            exception_mt: MT_PLAIN,
            ..TestProvider::default()
        };
        ClrHeap::new(mem, abi, types, &provider, SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_weak_and_zero_refcount_handles_excluded() {
        let heap = test_heap(|_| {});
        let source = FakeHandles(vec![
            handle(0x5000, SEG, HandleKind::WeakShort),
            handle(0x5008, SEG, HandleKind::WeakLong),
            handle(0x5010, SEG, HandleKind::Dependent),
            handle(0x5018, SEG, HandleKind::RefCount), // count 0
            handle(0x5020, SEG + 24, HandleKind::Strong),
        ]);
        let roots = handle_roots(&heap, &source, &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].object, SEG + 24);
        assert_eq!(roots[0].kind, RootKind::StrongHandle);
        assert!(!roots[0].pinned);
    }

    #[test]
    fn test_nonzero_refcount_handle_roots() {
        let heap = test_heap(|_| {});
        let mut h = handle(0x5000, SEG, HandleKind::RefCount);
        h.ref_count = 2;
        let roots = handle_roots(&heap, &FakeHandles(vec![h]), &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].kind, RootKind::RefCountHandle);
    }

    #[test]
    fn test_handle_category_ordering() {
        let heap = test_heap(|_| {});
        let source = FakeHandles(vec![
            handle(0x5000, SEG, HandleKind::Strong),
            handle(0x5008, SEG + 24, HandleKind::Pinned),
            handle(0x5010, SEG + 48, HandleKind::AsyncPinned),
        ]);
        let roots = handle_roots(&heap, &source, &CancelToken::new()).unwrap();
        let kinds: Vec<_> = roots.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RootKind::AsyncPinnedHandle,
                RootKind::PinnedHandle,
                RootKind::StrongHandle,
            ]
        );
        assert!(roots[0].pinned && roots[1].pinned);
    }

    // Overlapped I/O state object, kept off the walked segment so its
    // user-object field (offset 24) can be poked freely.
    const OVL: Addr = 0x28_0000;

    #[test]
    fn test_async_pinned_object_array_expands_element_wise() {
        let array = 0x29_0000;
        let heap = test_heap(|target| {
            target.object(OVL, MT_PLAIN);
            target.poke_u64(OVL + 24, array);
            target.array_object(array, MT_OBJ_ARRAY, 2);
            target.poke_u64(array + 16, SEG); // element 0
            target.poke_u64(array + 24, SEG + 48); // element 1
            target.map_range(array, array + 40);
        });
        let source = FakeHandles(vec![handle(0x5000, OVL, HandleKind::AsyncPinned)]);
        let roots = handle_roots(&heap, &source, &CancelToken::new()).unwrap();

        // Handle target itself plus one root per array element.
        assert_eq!(roots.len(), 3);
        assert_eq!(roots[0].object, OVL);
        assert_eq!(roots[1].object, SEG);
        assert_eq!(roots[2].object, SEG + 48);
        assert_eq!(roots[1].address, array + 16);
        assert!(roots.iter().all(|r| r.pinned));
    }

    #[test]
    fn test_async_pinned_non_array_reports_whole_object() {
        let heap = test_heap(|target| {
            target.object(OVL, MT_PLAIN);
            target.poke_u64(OVL + 24, SEG + 48);
        });
        let source = FakeHandles(vec![handle(0x5000, OVL, HandleKind::AsyncPinned)]);
        let roots = handle_roots(&heap, &source, &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[1].object, SEG + 48);
        assert_eq!(roots[1].address, OVL + 24);
    }

    #[test]
    fn test_unresolvable_target_dropped() {
        let heap = test_heap(|_| {});
        let source = FakeHandles(vec![handle(0x5000, 0xDEAD_0000, HandleKind::Strong)]);
        let roots = handle_roots(&heap, &source, &CancelToken::new()).unwrap();
        assert!(roots.is_empty());
    }

    #[test]
    fn test_static_slots_independently_failable() {
        let heap = test_heap(|target| {
            target.poke_u64(0x6000, SEG); // readable, live
            target.poke_u64(0x6008, 0); // null
        });
        let slot = |address, thread| StaticFieldSlot {
            address,
            domain: 0,
            thread,
            name: String::new(),
        };
        let source = FakeStatics(vec![
            slot(0x6000, None),
            slot(0x6008, None),
            slot(0xBAD0_0000, None), // unreadable
            slot(0x6000, Some(7)),
        ]);
        let roots = static_roots(&heap, &source, &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].kind, RootKind::StaticVar);
        assert_eq!(roots[0].domain, Some(0));
        assert_eq!(roots[0].thread, None);
        assert_eq!(roots[1].kind, RootKind::ThreadStaticVar);
        assert_eq!(roots[1].thread, Some(7));
    }

    #[test]
    fn test_stack_roots_skip_dead_threads_and_dedup_inexact() {
        let heap = test_heap(|_| {});
        let stack_ref = |address, object| StackRef {
            address,
            object,
            interior: false,
            pinned: false,
        };
        let mut refs = FxHashMap::default();
        refs.insert(1, vec![stack_ref(0x7000, SEG), stack_ref(0x7008, SEG)]);
        refs.insert(2, vec![stack_ref(0x8000, SEG + 24)]);
        let thread = |id, alive| ThreadInfo {
            id,
            alive,
            stack_base: 0,
            stack_limit: 0,
        };
        let source = FakeThreads {
            threads: vec![thread(1, true), thread(2, false)],
            refs,
            exact: false,
        };
        let roots = stack_roots(&heap, &source, &CancelToken::new()).unwrap();
        // Thread 1's duplicate collapses, dead thread 2 contributes nothing.
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].object, SEG);
        assert_eq!(roots[0].kind, RootKind::Stack);
        assert_eq!(roots[0].thread, Some(1));
        assert_eq!(roots[0].domain, None);
    }

    #[test]
    fn test_exact_walk_keeps_duplicates() {
        let heap = test_heap(|_| {});
        let mut refs = FxHashMap::default();
        refs.insert(
            1,
            vec![
                StackRef { address: 0x7000, object: SEG, interior: false, pinned: false },
                StackRef { address: 0x7008, object: SEG, interior: false, pinned: true },
            ],
        );
        let source = FakeThreads {
            threads: vec![ThreadInfo { id: 1, alive: true, stack_base: 0, stack_limit: 0 }],
            refs,
            exact: true,
        };
        let roots = stack_roots(&heap, &source, &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_finalizer_queue_null_slots_skipped() {
        let heap = test_heap(|target| {
            target.poke_u64(0x9000, SEG);
            target.poke_u64(0x9008, 0);
            target.poke_u64(0x9010, SEG + 24);
        });
        let segs = [FinalizerQueueSegment { start: 0x9000, end: 0x9018 }];
        let roots = finalizer_roots(&heap, &segs, &CancelToken::new()).unwrap();
        assert_eq!(roots.len(), 2);
        assert!(roots.iter().all(|r| r.kind == RootKind::Finalizer));
    }

    #[test]
    fn test_dependent_map_keyed_by_primary() {
        let mut a = handle(0x5000, SEG, HandleKind::Dependent);
        a.dependent_target = SEG + 24;
        let mut b = handle(0x5008, SEG, HandleKind::Dependent);
        b.dependent_target = SEG + 48;
        let c = handle(0x5010, SEG + 24, HandleKind::Strong);
        let map =
            dependent_handle_map(&FakeHandles(vec![a, b, c]), &CancelToken::new()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&SEG], vec![SEG + 24, SEG + 48]);
    }

    #[test]
    fn test_cancellation_propagates() {
        let heap = test_heap(|_| {});
        let cancel = CancelToken::new();
        cancel.cancel();
        let source = FakeHandles(vec![handle(0x5000, SEG, HandleKind::Strong)]);
        assert!(handle_roots(&heap, &source, &cancel).is_err());
    }
}
