//! Heap-shape contract: what the runtime-internal reader must supply for
//! the walker to reconstruct the managed heap.
//!
//! A provider is consulted exactly once per heap (re)construction; the data
//! it returns is snapshotted into immutable structures.

use crate::memory::Addr;

/// Raw description of one GC heap segment, before validation.
#[derive(Debug, Clone, Copy)]
pub struct SegmentData {
    /// Segment start address.
    pub start: Addr,
    /// Address of the first object in the segment.
    pub first_object: Addr,
    /// End of the committed (object-bearing) range.
    pub committed_end: Addr,
    /// Hard end of the segment's reserved range.
    pub end: Addr,
    /// Large-object segment: different alignment and collection treatment.
    pub large: bool,
}

/// One contiguous chunk of the finalizer queue, a raw pointer array.
#[derive(Debug, Clone, Copy)]
pub struct FinalizerQueueSegment {
    /// First slot address.
    pub start: Addr,
    /// One past the last slot address.
    pub end: Addr,
}

/// Everything the heap walker needs from the runtime's internal structures.
pub trait HeapProvider: Send + Sync {
    /// GC segments, in any order; the walker sorts and validates them.
    fn segments(&self) -> Vec<SegmentData>;

    /// Thread-local allocation buffers as (bump pointer, limit) pairs.
    /// The range between a bump pointer and its limit holds no objects.
    fn allocation_contexts(&self) -> Vec<(Addr, Addr)>;

    /// Finalizer-queue chunks holding *root* entries (objects whose
    /// finalizers have not run and which are therefore still reachable).
    fn finalizer_roots(&self) -> Vec<FinalizerQueueSegment>;

    /// Finalizer-queue chunks holding registered finalizable objects.
    fn finalizer_objects(&self) -> Vec<FinalizerQueueSegment>;

    /// Method table of the free-space sentinel type.
    fn free_method_table(&self) -> Addr;

    /// Method table of the string type.
    fn string_method_table(&self) -> Addr;

    /// Method table of the root object type.
    fn object_method_table(&self) -> Addr;

    /// Method table of the base exception type.
    fn exception_method_table(&self) -> Addr;

    /// Whether the target's GC state is consistent enough to walk (a
    /// process stopped mid-collection is not).
    fn can_walk_heap(&self) -> bool {
        true
    }

    /// Server GC (one heap per core) rather than workstation GC.
    fn is_server(&self) -> bool {
        false
    }
}
