//! Synthetic-target construction.
//!
//! Lays out method tables, GC descriptors, and objects in a byte map and
//! produces a [`SnapshotMemory`] from it. Used by this workspace's test
//! suites and useful for reproducing walker behavior against hand-built
//! heaps without a real dump.

use clrscope_core::abi::mt_layout;
use clrscope_core::{Addr, FinalizerQueueSegment, HeapProvider, SegmentData, SnapshotMemory};
use std::collections::BTreeMap;

/// Pokes closer together than this end up in one zero-filled region;
/// larger gaps stay unmapped (and therefore unreadable).
const REGION_MERGE_GAP: u64 = 0x1000;

/// Structural description of a synthetic method table.
#[derive(Debug, Clone, Copy)]
pub struct MtSpec {
    pub base_size: u32,
    pub component_size: u32,
    pub token: u32,
    pub module: Addr,
    pub domain: u32,
    pub parent: Addr,
    /// 0 = none, 1 = reference elements, 2 = value elements.
    pub component_kind: u32,
    pub contains_pointers: bool,
    pub is_free: bool,
    pub shared: bool,
    pub collectible: bool,
    pub loader_allocator_handle: Addr,
}

impl Default for MtSpec {
    fn default() -> Self {
        Self {
            base_size: 24,
            component_size: 0,
            token: 0x0200_0001,
            module: 0x7000_0000,
            domain: 0,
            parent: 0,
            component_kind: 0,
            contains_pointers: false,
            is_free: false,
            shared: false,
            collectible: false,
            loader_allocator_handle: 0,
        }
    }
}

/// Byte-level builder for a synthetic target address space.
pub struct TargetBuilder {
    pointer_size: u32,
    bytes: BTreeMap<Addr, u8>,
}

impl TargetBuilder {
    /// Start an empty target with the given pointer width.
    pub fn new(pointer_size: u32) -> Self {
        Self {
            pointer_size,
            bytes: BTreeMap::new(),
        }
    }

    /// Write raw bytes at `addr`.
    pub fn poke(&mut self, addr: Addr, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, b);
        }
    }

    /// Write a little-endian `u32`.
    pub fn poke_u32(&mut self, addr: Addr, value: u32) {
        self.poke(addr, &value.to_le_bytes());
    }

    /// Write a little-endian `u64`.
    pub fn poke_u64(&mut self, addr: Addr, value: u64) {
        self.poke(addr, &value.to_le_bytes());
    }

    /// Write a pointer-sized value.
    pub fn poke_word(&mut self, addr: Addr, value: u64) {
        if self.pointer_size == 4 {
            self.poke_u32(addr, value as u32);
        } else {
            self.poke_u64(addr, value);
        }
    }

    /// Ensure `[start, end)` is mapped, zero-filling unwritten bytes.
    pub fn map_range(&mut self, start: Addr, end: Addr) {
        for addr in start..end {
            self.bytes.entry(addr).or_insert(0);
        }
    }

    /// Lay out a method table at `addr` in the descriptor format the
    /// desktop ABI decodes.
    pub fn method_table(&mut self, addr: Addr, spec: MtSpec) {
        let mut flags = 0u32;
        if spec.is_free {
            flags |= mt_layout::flags::FREE;
        }
        if spec.contains_pointers {
            flags |= mt_layout::flags::CONTAINS_POINTERS;
        }
        if spec.shared {
            flags |= mt_layout::flags::SHARED;
        }
        if spec.collectible {
            flags |= mt_layout::flags::COLLECTIBLE;
        }
        self.poke_u32(addr + mt_layout::COMPONENT_SIZE, spec.component_size);
        self.poke_u32(addr + mt_layout::FLAGS, flags);
        self.poke_u32(addr + mt_layout::BASE_SIZE, spec.base_size);
        self.poke_u32(addr + mt_layout::TOKEN, spec.token);
        self.poke_u64(addr + mt_layout::PARENT, spec.parent);
        self.poke_u64(addr + mt_layout::MODULE, spec.module);
        self.poke_u64(
            addr + mt_layout::LOADER_ALLOCATOR,
            spec.loader_allocator_handle,
        );
        self.poke_u32(addr + mt_layout::DOMAIN, spec.domain);
        self.poke_u32(addr + mt_layout::COMPONENT_KIND, spec.component_kind);
    }

    /// Lay out a positive-count GC descriptor below `mt`: one
    /// `(offset, size_bias)` entry per series, walked in slice order.
    pub fn gcdesc_runs(&mut self, mt: Addr, series: &[(u64, i64)]) {
        let word = u64::from(self.pointer_size);
        self.poke_word(mt - word, series.len() as u64);
        for (j, &(offset, size_bias)) in series.iter().enumerate() {
            let j = j as u64;
            self.poke_word(mt - word * (2 + 2 * j), offset);
            self.poke_word(mt - word * (3 + 2 * j), size_bias as u64);
        }
    }

    /// Lay out a repeating (negative-count) GC descriptor below `mt`:
    /// a series start offset plus `(nptrs, skip)` items applied per
    /// array element.
    pub fn gcdesc_repeat(&mut self, mt: Addr, offset: u64, items: &[(u32, u32)]) {
        let word = u64::from(self.pointer_size);
        self.poke_word(mt - word, (-(items.len() as i64)) as u64);
        self.poke_word(mt - word * 2, offset);
        for (k, &(nptrs, skip)) in items.iter().enumerate() {
            let base = mt - word * 2 - 8 * (k as u64 + 1);
            self.poke_u32(base, nptrs);
            self.poke_u32(base + 4, skip);
        }
    }

    /// Place an object header (method-table pointer) at `addr`.
    pub fn object(&mut self, addr: Addr, mt: Addr) {
        self.poke_word(addr, mt);
    }

    /// Place an array-like object: method-table pointer plus the element
    /// count in the following slot.
    pub fn array_object(&mut self, addr: Addr, mt: Addr, count: u32) {
        self.poke_word(addr, mt);
        self.poke_u32(addr + u64::from(self.pointer_size), count);
    }

    /// Coalesce everything written so far into snapshot regions.
    pub fn finish(self) -> SnapshotMemory {
        let mut mem = SnapshotMemory::new(self.pointer_size);
        let mut iter = self.bytes.into_iter();
        let Some((first_addr, first_byte)) = iter.next() else {
            return mem;
        };
        let mut base = first_addr;
        let mut data = vec![first_byte];
        for (addr, byte) in iter {
            let end = base + data.len() as u64;
            if addr - end <= REGION_MERGE_GAP {
                data.resize((addr - base) as usize, 0);
                data.push(byte);
            } else {
                mem.add_region(base, std::mem::take(&mut data));
                base = addr;
                data.push(byte);
            }
        }
        mem.add_region(base, data);
        mem
    }
}

/// In-memory [`HeapProvider`] with every field settable directly.
pub struct TestProvider {
    pub segments: Vec<SegmentData>,
    pub allocation_contexts: Vec<(Addr, Addr)>,
    pub finalizer_roots: Vec<FinalizerQueueSegment>,
    pub finalizer_objects: Vec<FinalizerQueueSegment>,
    pub free_mt: Addr,
    pub string_mt: Addr,
    pub object_mt: Addr,
    pub exception_mt: Addr,
    pub can_walk: bool,
    pub server: bool,
}

impl Default for TestProvider {
    fn default() -> Self {
        Self {
            segments: Vec::new(),
            allocation_contexts: Vec::new(),
            finalizer_roots: Vec::new(),
            finalizer_objects: Vec::new(),
            free_mt: 0,
            string_mt: 0,
            object_mt: 0,
            exception_mt: 0,
            can_walk: true,
            server: false,
        }
    }
}

impl HeapProvider for TestProvider {
    fn segments(&self) -> Vec<SegmentData> {
        self.segments.clone()
    }

    fn allocation_contexts(&self) -> Vec<(Addr, Addr)> {
        self.allocation_contexts.clone()
    }

    fn finalizer_roots(&self) -> Vec<FinalizerQueueSegment> {
        self.finalizer_roots.clone()
    }

    fn finalizer_objects(&self) -> Vec<FinalizerQueueSegment> {
        self.finalizer_objects.clone()
    }

    fn free_method_table(&self) -> Addr {
        self.free_mt
    }

    fn string_method_table(&self) -> Addr {
        self.string_mt
    }

    fn object_method_table(&self) -> Addr {
        self.object_mt
    }

    fn exception_method_table(&self) -> Addr {
        self.exception_mt
    }

    fn can_walk_heap(&self) -> bool {
        self.can_walk
    }

    fn is_server(&self) -> bool {
        self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrscope_core::MemoryExt;

    #[test]
    fn test_distant_pokes_stay_unmapped_between() {
        let mut target = TargetBuilder::new(8);
        target.poke_u64(0x1000, 1);
        target.poke_u64(0x9000, 2);
        let mem = target.finish();
        assert_eq!(mem.read_u64(0x1000), Some(1));
        assert_eq!(mem.read_u64(0x9000), Some(2));
        assert_eq!(mem.read_u64(0x5000), None);
    }

    #[test]
    fn test_nearby_pokes_zero_fill() {
        let mut target = TargetBuilder::new(8);
        target.poke_u64(0x1000, 1);
        target.poke_u64(0x1100, 2);
        let mem = target.finish();
        assert_eq!(mem.read_u64(0x1080), Some(0));
    }
}
