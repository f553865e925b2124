//! The heap walker: typed object enumeration over validated segments.
//!
//! Walking is a bump-pointer scan per segment. Each step reads the
//! method-table pointer at the cursor, resolves it through the session's
//! type cache, computes the instance size, yields the object, and advances
//! by the aligned size. Allocation-context gaps are jumped, large-object
//! segments use 8-byte alignment, and any unreadable or untypeable position
//! ends that segment's scan without failing the enumeration.

use crate::segment::{build_segments, AllocationContexts, Segment};
use crate::types::{ClrType, TypeFactory};
use clrscope_core::{
    Addr, HeapProvider, MemoryExt, MemorySource, Result, RuntimeAbi, SessionConfig,
};
use log::{debug, warn};
use std::cell::Cell;
use std::sync::Arc;

/// One typed object instance on the heap.
#[derive(Debug, Clone)]
pub struct ClrObject {
    address: Addr,
    ty: Arc<ClrType>,
    size: u64,
}

impl ClrObject {
    pub(crate) fn new(address: Addr, ty: Arc<ClrType>, size: u64) -> Self {
        Self { address, ty, size }
    }

    /// The object's start address.
    pub fn address(&self) -> Addr {
        self.address
    }

    /// The object's resolved type.
    pub fn ty(&self) -> &Arc<ClrType> {
        &self.ty
    }

    /// Total instance size in bytes, before alignment.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is a free-space gap rather than a live object.
    pub fn is_free(&self) -> bool {
        self.ty.is_free()
    }
}

/// One outgoing object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef {
    /// Referenced object address.
    pub target: Addr,
    /// Offset of the holding slot within the source object, or `None` for
    /// references that exist outside the instance data (a collectible
    /// type's loader allocator).
    pub offset: Option<u64>,
}

/// A reconstructed view of the target's GC heap.
///
/// Construction snapshots and validates the segment table; everything else
/// is computed lazily on demand. The walker itself holds only a small
/// amount of interior mutability (the last-hit segment index), so it is
/// meant to be owned by one analysis session, not shared across threads.
pub struct ClrHeap {
    mem: Arc<dyn MemorySource>,
    abi: Arc<dyn RuntimeAbi>,
    types: Arc<TypeFactory>,
    segments: Vec<Segment>,
    alloc_contexts: AllocationContexts,
    config: SessionConfig,
    can_walk: bool,
    server: bool,
    free_ty: Option<Arc<ClrType>>,
    string_ty: Option<Arc<ClrType>>,
    object_ty: Option<Arc<ClrType>>,
    exception_ty: Option<Arc<ClrType>>,
    // Address lookups cluster heavily; remember where the last one landed.
    last_segment: Cell<usize>,
}

impl ClrHeap {
    /// Build the heap view from one provider consultation.
    pub fn new(
        mem: Arc<dyn MemorySource>,
        abi: Arc<dyn RuntimeAbi>,
        types: Arc<TypeFactory>,
        provider: &dyn HeapProvider,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let segments = build_segments(provider.segments())?;
        let alloc_contexts = AllocationContexts::new(provider.allocation_contexts());
        let can_walk = provider.can_walk_heap();
        if !can_walk {
            warn!("target GC state is inconsistent; heap walks will yield nothing");
        }
        debug!(
            "heap view: {} segments, {} allocation contexts",
            segments.len(),
            alloc_contexts.len()
        );
        // The well-known types resolve once up front; every later string
        // and free-space check is a pointer comparison against them.
        let free_ty = types.get_or_create(provider.free_method_table(), 0);
        let string_ty = types.get_or_create(provider.string_method_table(), 0);
        let object_ty = types.get_or_create(provider.object_method_table(), 0);
        let exception_ty = types.get_or_create(provider.exception_method_table(), 0);
        Ok(Self {
            mem,
            abi,
            types,
            segments,
            alloc_contexts,
            config,
            can_walk,
            server: provider.is_server(),
            free_ty,
            string_ty,
            object_ty,
            exception_ty,
            last_segment: Cell::new(0),
        })
    }

    /// The validated segment table, ascending by start address.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the target's GC state permits walking at all.
    pub fn can_walk(&self) -> bool {
        self.can_walk
    }

    /// The session's type cache.
    pub fn types(&self) -> &Arc<TypeFactory> {
        &self.types
    }

    /// The memory source the heap reads through.
    pub fn memory(&self) -> &Arc<dyn MemorySource> {
        &self.mem
    }

    /// Target pointer width in bytes.
    pub fn pointer_size(&self) -> u32 {
        self.mem.pointer_size()
    }

    /// Session configuration in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the target runs the server GC (one heap per core).
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// The root object type, when the target's descriptor resolves.
    pub fn object_type(&self) -> Option<&Arc<ClrType>> {
        self.object_ty.as_ref()
    }

    /// The base exception type, when the target's descriptor resolves.
    pub fn exception_type(&self) -> Option<&Arc<ClrType>> {
        self.exception_ty.as_ref()
    }

    /// The string type, when the target's descriptor resolves.
    pub fn string_type(&self) -> Option<&Arc<ClrType>> {
        self.string_ty.as_ref()
    }

    /// The segment containing `addr`, if any.
    ///
    /// Consecutive lookups tend to hit the same segment, so the search
    /// starts at the last hit and wraps around.
    pub fn segment_for(&self, addr: Addr) -> Option<&Segment> {
        if self.segments.is_empty() {
            return None;
        }
        let n = self.segments.len();
        let start = self.last_segment.get().min(n - 1);
        for step in 0..n {
            let i = (start + step) % n;
            if self.segments[i].contains(addr) {
                self.last_segment.set(i);
                return Some(&self.segments[i]);
            }
        }
        None
    }

    /// Smallest legal object footprint.
    fn min_object_size(&self) -> u64 {
        3 * u64::from(self.pointer_size())
    }

    /// Round `size` up to the allocation granularity of the segment kind.
    fn align(&self, size: u64, large: bool) -> u64 {
        let mask = if large {
            7
        } else {
            u64::from(self.pointer_size()) - 1
        };
        (size.max(self.min_object_size()) + mask) & !mask
    }

    /// Resolve the object at `addr`, or `None` when the position does not
    /// hold a typeable object.
    pub fn object_at(&self, addr: Addr) -> Option<ClrObject> {
        let mt = self.mem.read_ptr(addr)?;
        let ty = self.types.get_or_create(mt, addr)?;
        let size = self.object_size(addr, &ty)?;
        Some(ClrObject { address: addr, ty, size })
    }

    /// Point lookup of the type of the object starting at `addr`.
    pub fn object_type_at(&self, addr: Addr) -> Option<Arc<ClrType>> {
        let mt = self.mem.read_ptr(addr)?;
        self.types.get_or_create(mt, addr)
    }

    /// Compute the instance size of the object at `addr` with type `ty`.
    pub fn object_size(&self, addr: Addr, ty: &Arc<ClrType>) -> Option<u64> {
        let component_size = u64::from(ty.component_size());
        if component_size == 0 {
            return Some(u64::from(ty.base_size()));
        }
        let count_addr = addr + u64::from(self.pointer_size());
        let mut count = u64::from(self.mem.read_u32(count_addr)?);
        // Strings store their character count; the trailing terminator is
        // part of the allocation.
        if self.is_string(ty) {
            count += 1;
        }
        Some(u64::from(ty.base_size()) + count * component_size)
    }

    /// Whether `ty` is the string type.
    pub fn is_string(&self, ty: &Arc<ClrType>) -> bool {
        self.string_ty
            .as_ref()
            .is_some_and(|string| Arc::ptr_eq(ty, string))
    }

    /// The free-space sentinel type, used to mark untypeable positions in
    /// precomputed caches.
    pub fn free_type(&self) -> Option<&Arc<ClrType>> {
        self.free_ty.as_ref()
    }

    /// Lazily enumerate every object on the heap, free-space gaps included,
    /// in ascending address order.
    pub fn enumerate_objects(&self) -> impl Iterator<Item = ClrObject> + '_ {
        let segments: &[Segment] = if self.can_walk { &self.segments } else { &[] };
        segments
            .iter()
            .flat_map(move |seg| self.enumerate_segment_objects(seg))
    }

    /// Lazily enumerate the objects of one segment.
    pub fn enumerate_segment_objects<'a>(
        &'a self,
        seg: &'a Segment,
    ) -> impl Iterator<Item = ClrObject> + 'a {
        let mut cursor = seg.first_object;
        std::iter::from_fn(move || loop {
            if cursor >= seg.committed_end {
                return None;
            }
            // An allocation context's range holds no objects; hop over it.
            if let Some(limit) = self.alloc_contexts.limit_for(cursor) {
                cursor = limit + self.align(self.min_object_size(), seg.is_large());
                continue;
            }
            match self.step_object(cursor, seg) {
                Some(obj) => {
                    cursor = obj.address + self.align(obj.size, seg.is_large());
                    return Some(obj);
                }
                None => {
                    // Unreadable or untypeable position: the rest of this
                    // segment cannot be walked.
                    debug!(
                        "segment walk stopped at {cursor:#x} (segment {:#x})",
                        seg.start
                    );
                    return None;
                }
            }
        })
    }

    /// Segment walk for cache construction. Identical to
    /// [`enumerate_segment_objects`](Self::enumerate_segment_objects) except
    /// that an untypeable position emits one free-space sentinel entry
    /// before the scan stops, so the cache can still answer a lookup for
    /// that address.
    pub(crate) fn enumerate_segment_for_cache<'a>(
        &'a self,
        seg: &'a Segment,
    ) -> impl Iterator<Item = ClrObject> + 'a {
        let mut cursor = seg.first_object;
        let mut done = false;
        std::iter::from_fn(move || loop {
            if done || cursor >= seg.committed_end {
                return None;
            }
            if let Some(limit) = self.alloc_contexts.limit_for(cursor) {
                cursor = limit + self.align(self.min_object_size(), seg.is_large());
                continue;
            }
            match self.step_object(cursor, seg) {
                Some(obj) => {
                    cursor = obj.address + self.align(obj.size, seg.is_large());
                    return Some(obj);
                }
                None => {
                    done = true;
                    let free = self.free_type()?;
                    return Some(ClrObject {
                        address: cursor,
                        ty: free.clone(),
                        size: self.min_object_size(),
                    });
                }
            }
        })
    }

    fn step_object(&self, addr: Addr, seg: &Segment) -> Option<ClrObject> {
        let mt = self.mem.read_ptr(addr)?;
        if mt == 0 {
            return None;
        }
        let ty = self.types.get_or_create(mt, addr)?;
        let size = self.object_size(addr, &ty)?;
        if addr.saturating_add(size) > seg.committed_end {
            debug!("object at {addr:#x} (size {size}) overruns its segment");
            return None;
        }
        Some(ClrObject { address: addr, ty, size })
    }

    /// Lazily enumerate the objects `obj` references.
    ///
    /// With `carefully` set, the object is first validated against its
    /// segment (sane size, in-bounds); failing validation yields nothing.
    /// Collectible types additionally reference their loader-allocator
    /// object, reported with `offset: None`.
    pub fn enumerate_object_references<'a>(
        &'a self,
        obj: &ClrObject,
        carefully: bool,
    ) -> Box<dyn Iterator<Item = ObjRef> + 'a> {
        let addr = obj.address;
        let size = obj.size;
        let ty = obj.ty.clone();

        if carefully && !self.validate_object(addr, size) {
            return Box::new(std::iter::empty());
        }

        let loader_allocator = if ty.is_collectible() {
            self.mem
                .read_ptr(ty.loader_allocator_handle())
                .filter(|&target| target != 0)
                .map(|target| ObjRef {
                    target,
                    offset: None,
                })
        } else {
            None
        };

        if !ty.contains_pointers() {
            return Box::new(loader_allocator.into_iter());
        }
        let Some(map) = ty.gc_map(&*self.mem) else {
            return Box::new(loader_allocator.into_iter());
        };

        let mem = self.mem.clone();
        let word = self.pointer_size();
        let slots = map
            .walk_object(addr, size, word, move |slot| mem.read_ptr(slot))
            .map(|(target, offset)| ObjRef {
                target,
                offset: Some(offset),
            });
        Box::new(loader_allocator.into_iter().chain(slots))
    }

    fn validate_object(&self, addr: Addr, size: u64) -> bool {
        let Some(seg) = self.segment_for(addr) else {
            return false;
        };
        if addr.saturating_add(size) > seg.committed_end {
            return false;
        }
        if !seg.is_large() && size > self.config.max_small_object_size {
            return false;
        }
        true
    }

    /// Read the string object at `addr`, or `None` when the address does
    /// not hold a readable string.
    ///
    /// The stored character count is clamped to the configured maximum; a
    /// pathological length yields a truncated string rather than an
    /// allocation bomb.
    pub fn read_string(&self, addr: Addr) -> Option<String> {
        let mt = self.mem.read_ptr(addr)?;
        let ty = self.types.get_or_create(mt, addr)?;
        if !self.is_string(&ty) {
            return None;
        }
        let word = self.pointer_size();
        let length = self
            .mem
            .read_u32(addr + self.abi.string_length_offset(word))?
            .min(self.config.max_string_length);
        let raw = self.mem.read_bytes(
            addr + self.abi.string_first_char_offset(word),
            length as usize * 2,
        )?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// First-element address of the array object at `addr`.
    pub fn array_data_address(&self, addr: Addr) -> Addr {
        addr + self.abi.array_data_offset(self.pointer_size())
    }

    /// Element count of the array-like object at `addr`.
    pub fn array_length(&self, addr: Addr) -> Option<u32> {
        self.mem.read_u32(addr + u64::from(self.pointer_size()))
    }

    /// The ABI accessor for the target's runtime build.
    pub fn abi(&self) -> &Arc<dyn RuntimeAbi> {
        &self.abi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MtSpec, TargetBuilder, TestProvider};
    use clrscope_core::{DesktopAbi, RuntimeVersion, SegmentData};

    const MT_PLAIN: Addr = 0x10_0000;
    const MT_WITH_REFS: Addr = 0x10_1000;
    const MT_STRING: Addr = 0x10_2000;
    const MT_FREE: Addr = 0x10_3000;
    const SEG: Addr = 0x20_0000;

    fn heap_from(target: TargetBuilder, provider: &TestProvider) -> ClrHeap {
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
        ClrHeap::new(mem, abi, types, provider, SessionConfig::default()).unwrap()
    }

    fn base_target() -> TargetBuilder {
        let mut target = TargetBuilder::new(8);
        target.method_table(MT_PLAIN, MtSpec::default());
        target.method_table(
            MT_WITH_REFS,
            MtSpec {
                base_size: 40,
                token: 0x0200_0002,
                contains_pointers: true,
                ..MtSpec::default()
            },
        );
        target.gcdesc_runs(MT_WITH_REFS, &[(8, -24)]);
        target.method_table(
            MT_STRING,
            MtSpec {
                base_size: 20,
                component_size: 2,
                token: 0x0200_0003,
                ..MtSpec::default()
            },
        );
        target.method_table(
            MT_FREE,
            MtSpec {
                is_free: true,
                token: 0,
                ..MtSpec::default()
            },
        );
        target
    }

    fn provider(committed_end: Addr) -> TestProvider {
        TestProvider {
            segments: vec![SegmentData {
                start: SEG,
                first_object: SEG,
                committed_end,
                end: committed_end,
                large: false,
            }],
            free_mt: MT_FREE,
            string_mt: MT_STRING,
            object_mt: MT_PLAIN,
            exception_mt: MT_PLAIN,
            ..TestProvider::default()
        }
    }

    #[test]
    fn test_walk_yields_objects_in_address_order() {
        let mut target = base_target();
        // Three 24-byte objects back to back.
        for i in 0..3u64 {
            target.object(SEG + i * 24, MT_PLAIN);
        }
        target.map_range(SEG, SEG + 3 * 24);
        let heap = heap_from(target, &provider(SEG + 3 * 24));

        let objects: Vec<_> = heap.enumerate_objects().collect();
        assert_eq!(objects.len(), 3);
        assert_eq!(
            objects.iter().map(|o| o.address()).collect::<Vec<_>>(),
            vec![SEG, SEG + 24, SEG + 48]
        );
        assert!(objects.windows(2).all(|w| w[0].address() < w[1].address()));
    }

    #[test]
    fn test_allocation_context_gap_is_skipped() {
        let mut target = base_target();
        target.object(SEG, MT_PLAIN);
        // Gap [SEG+24, SEG+96) is an allocation context; garbage inside.
        target.poke_u64(SEG + 24, 0xFFFF_FFFF_FFFF_FFFF);
        let resume = SEG + 96 + 24; // limit + aligned min object size
        target.object(resume, MT_PLAIN);
        target.map_range(SEG, resume + 24);
        let mut provider = provider(resume + 24);
        provider.allocation_contexts = vec![(SEG + 24, SEG + 96)];
        let heap = heap_from(target, &provider);

        let addrs: Vec<_> = heap.enumerate_objects().map(|o| o.address()).collect();
        assert_eq!(addrs, vec![SEG, resume]);
    }

    #[test]
    fn test_untypeable_position_truncates_segment() {
        let mut target = base_target();
        target.object(SEG, MT_PLAIN);
        target.poke_u64(SEG + 24, 0xBAD); // not a method table
        target.object(SEG + 48, MT_PLAIN); // unreachable by the walk
        target.map_range(SEG, SEG + 72);
        let heap = heap_from(target, &provider(SEG + 72));

        let addrs: Vec<_> = heap.enumerate_objects().map(|o| o.address()).collect();
        assert_eq!(addrs, vec![SEG]);
    }

    #[test]
    fn test_string_size_counts_terminator() {
        let mut target = base_target();
        target.array_object(SEG, MT_STRING, 5);
        target.map_range(SEG, SEG + 64);
        let heap = heap_from(target, &provider(SEG + 64));

        let obj = heap.object_at(SEG).unwrap();
        assert!(heap.is_string(obj.ty()));
        // base 20 + (5 + 1 terminator) * 2
        assert_eq!(obj.size(), 32);
    }

    #[test]
    fn test_read_string() {
        let mut target = base_target();
        target.array_object(SEG, MT_STRING, 2);
        for (i, unit) in "hi".encode_utf16().enumerate() {
            target.poke(SEG + 12 + i as u64 * 2, &unit.to_le_bytes());
        }
        target.map_range(SEG, SEG + 64);
        let heap = heap_from(target, &provider(SEG + 64));

        assert_eq!(heap.read_string(SEG).as_deref(), Some("hi"));
        // A non-string object reads as no string at all.
        let mut target = base_target();
        target.object(SEG, MT_PLAIN);
        target.map_range(SEG, SEG + 24);
        let heap = heap_from(target, &provider(SEG + 24));
        assert_eq!(heap.read_string(SEG), None);
    }

    #[test]
    fn test_object_references_at_mapped_offsets() {
        let mut target = base_target();
        target.object(SEG, MT_WITH_REFS);
        target.poke_u64(SEG + 8, 0x111);
        target.poke_u64(SEG + 16, 0x222);
        target.map_range(SEG, SEG + 40);
        let heap = heap_from(target, &provider(SEG + 40));

        let obj = heap.object_at(SEG).unwrap();
        let refs: Vec<_> = heap.enumerate_object_references(&obj, false).collect();
        assert_eq!(
            refs,
            vec![
                ObjRef { target: 0x111, offset: Some(8) },
                ObjRef { target: 0x222, offset: Some(16) },
            ]
        );
    }

    #[test]
    fn test_careful_mode_rejects_oversized_small_object() {
        let mut target = base_target();
        target.object(SEG, MT_WITH_REFS);
        target.poke_u64(SEG + 8, 0x111);
        target.map_range(SEG, SEG + 40);
        let heap = heap_from(target, &provider(SEG + 40));

        let obj = heap.object_at(SEG).unwrap();
        let fake = ClrObject {
            address: obj.address(),
            ty: obj.ty().clone(),
            size: 200_000,
        };
        assert_eq!(heap.enumerate_object_references(&fake, true).count(), 0);
        // The genuine object still enumerates.
        assert!(heap.enumerate_object_references(&obj, true).count() > 0);
    }

    #[test]
    fn test_collectible_type_references_loader_allocator() {
        let mut target = base_target();
        let handle_slot = 0x30_0000;
        target.method_table(
            0x10_4000,
            MtSpec {
                token: 0x0200_0009,
                collectible: true,
                loader_allocator_handle: handle_slot,
                ..MtSpec::default()
            },
        );
        target.poke_u64(handle_slot, 0xA110C);
        target.object(SEG, 0x10_4000);
        target.map_range(SEG, SEG + 24);
        let heap = heap_from(target, &provider(SEG + 24));

        let obj = heap.object_at(SEG).unwrap();
        let refs: Vec<_> = heap.enumerate_object_references(&obj, false).collect();
        assert_eq!(
            refs,
            vec![ObjRef { target: 0xA110C, offset: None }]
        );
    }

    #[test]
    fn test_segment_for_caches_last_hit() {
        let mut target = base_target();
        target.map_range(SEG, SEG + 24);
        target.map_range(0x40_0000, 0x40_0018);
        let mut provider = provider(SEG + 24);
        provider.segments.push(SegmentData {
            start: 0x40_0000,
            first_object: 0x40_0000,
            committed_end: 0x40_0018,
            end: 0x40_0018,
            large: true,
        });
        let heap = heap_from(target, &provider);

        assert_eq!(heap.segment_for(0x40_0010).unwrap().start, 0x40_0000);
        assert_eq!(heap.segment_for(SEG + 8).unwrap().start, SEG);
        assert!(heap.segment_for(0x50_0000).is_none());
    }

    #[test]
    fn test_large_segment_alignment() {
        let heap = heap_from(base_target(), &provider(SEG));
        assert_eq!(heap.align(25, false), 32);
        assert_eq!(heap.align(25, true), 32);
        assert_eq!(heap.align(33, true), 40);
        // Undersized values round up to the minimum object footprint.
        assert_eq!(heap.align(1, false), 24);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn align_never_shrinks_and_respects_granularity(
                size in 0u64..1_000_000,
                large in proptest::bool::ANY,
            ) {
                let heap = heap_from(base_target(), &provider(SEG));
                let aligned = heap.align(size, large);
                prop_assert!(aligned >= size);
                prop_assert!(aligned >= heap.min_object_size());
                // 8 both ways on a 64-bit target.
                prop_assert_eq!(aligned % 8, 0);
                // Alignment is idempotent.
                prop_assert_eq!(heap.align(aligned, large), aligned);
            }
        }
    }

    #[test]
    fn test_well_known_types_resolve_at_construction() {
        let heap = heap_from(base_target(), &provider(SEG));
        assert!(heap.free_type().is_some_and(|ty| ty.is_free()));
        assert!(heap.string_type().is_some());
        assert!(heap.object_type().is_some());
        assert!(heap.exception_type().is_some());
        // Object and exception share a method table in this target.
        assert!(Arc::ptr_eq(
            heap.object_type().unwrap(),
            heap.exception_type().unwrap()
        ));
    }

    #[test]
    fn test_server_gc_flag_carried_from_provider() {
        let mut provider = provider(SEG);
        provider.server = true;
        let heap = heap_from(base_target(), &provider);
        assert!(heap.is_server());
    }

    #[test]
    fn test_unwalkable_heap_yields_nothing() {
        let mut target = base_target();
        target.object(SEG, MT_PLAIN);
        target.map_range(SEG, SEG + 24);
        let mut provider = provider(SEG + 24);
        provider.can_walk = false;
        let heap = heap_from(target, &provider);

        assert!(!heap.can_walk());
        assert_eq!(heap.enumerate_objects().count(), 0);
    }
}
