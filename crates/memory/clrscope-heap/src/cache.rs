//! Precomputed heap snapshot for repeatable queries.
//!
//! The lazy walker recomputes everything per enumeration; analyses that
//! query the same heap many times (dominator trees, retained-size sweeps)
//! want one pass that materializes every object's address, type, and size,
//! plus an ordered address index answering "what object is here" without
//! re-reading target memory.
//!
//! Storage is deliberately chunked and sharded rather than flat: a large
//! server-GC heap can hold hundreds of millions of objects, and single
//! contiguous allocations of that size both fragment the address space and
//! stall on resize.

use crate::types::ClrType;
use crate::walker::{ClrHeap, ClrObject, ObjRef};
use clrscope_core::{Addr, CancelToken, Result};
use log::info;
use std::sync::Arc;

/// Entries per chunk of the object array.
const CHUNK_ENTRIES: usize = 64 * 1024;

/// One cached object entry.
#[derive(Clone)]
struct CacheEntry {
    address: Addr,
    ty: Arc<ClrType>,
    size: u64,
    refs: Box<[ObjRef]>,
}

/// Append-only object storage in fixed-size chunks.
struct ChunkedVec {
    chunks: Vec<Vec<CacheEntry>>,
    len: usize,
}

impl ChunkedVec {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }

    fn push(&mut self, entry: CacheEntry) {
        match self.chunks.last_mut() {
            Some(chunk) if chunk.len() < CHUNK_ENTRIES => chunk.push(entry),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_ENTRIES);
                chunk.push(entry);
                self.chunks.push(chunk);
            }
        }
        self.len += 1;
    }

    fn get(&self, index: usize) -> Option<&CacheEntry> {
        self.chunks
            .get(index / CHUNK_ENTRIES)?
            .get(index % CHUNK_ENTRIES)
    }

    fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.chunks.iter().flatten()
    }
}

/// One shard of the ordered address index. Entries are appended in
/// ascending address order, so an entry's object index is the shard's base
/// plus its position.
struct Shard {
    base_index: usize,
    addrs: Vec<Addr>,
}

/// Ordered address → object-index map, split into bounded shards.
struct ShardedAddressMap {
    shards: Vec<Shard>,
    shard_capacity: usize,
}

impl ShardedAddressMap {
    fn new(shard_capacity: usize) -> Self {
        Self {
            shards: Vec::new(),
            shard_capacity,
        }
    }

    fn push(&mut self, addr: Addr, index: usize) {
        match self.shards.last_mut() {
            Some(shard) if shard.addrs.len() < self.shard_capacity => shard.addrs.push(addr),
            _ => self.shards.push(Shard {
                base_index: index,
                addrs: vec![addr],
            }),
        }
    }

    /// Exact-address lookup.
    fn index_of(&self, addr: Addr) -> Option<usize> {
        // Last shard whose first address is <= addr.
        let shard_pos = self
            .shards
            .partition_point(|shard| shard.addrs[0] <= addr)
            .checked_sub(1)?;
        let shard = &self.shards[shard_pos];
        let pos = shard.addrs.binary_search(&addr).ok()?;
        Some(shard.base_index + pos)
    }

    /// Index of the last entry at or below `addr`.
    fn index_at_or_below(&self, addr: Addr) -> Option<usize> {
        let shard_pos = self
            .shards
            .partition_point(|shard| shard.addrs[0] <= addr)
            .checked_sub(1)?;
        let shard = &self.shards[shard_pos];
        let pos = shard.addrs.partition_point(|&a| a <= addr).checked_sub(1)?;
        Some(shard.base_index + pos)
    }
}

/// An immutable, fully materialized snapshot of the heap's object layout.
pub struct HeapCache {
    entries: ChunkedVec,
    index: ShardedAddressMap,
}

impl std::fmt::Debug for HeapCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapCache")
            .field("objects", &self.entries.len)
            .field("shards", &self.index.shards.len())
            .finish()
    }
}

impl HeapCache {
    /// Walk every segment once and materialize the result, outgoing
    /// references included (gathered in careful mode, since the input may
    /// be arbitrarily corrupt).
    ///
    /// Positions the walker cannot type are recorded as free-space
    /// sentinels (the rest of that segment stays unmapped, exactly as the
    /// lazy walk would report it). Cancellation aborts with
    /// [`Error::Cancelled`](clrscope_core::Error::Cancelled) and discards
    /// partial state.
    pub fn build(heap: &ClrHeap, cancel: &CancelToken) -> Result<Self> {
        let mut entries = ChunkedVec::new();
        let mut index = ShardedAddressMap::new(heap.config().cache_shard_capacity);

        for seg in heap.segments() {
            for obj in heap.enumerate_segment_for_cache(seg) {
                cancel.check()?;
                let refs: Box<[ObjRef]> = if obj.is_free() {
                    Box::default()
                } else {
                    heap.enumerate_object_references(&obj, true).collect()
                };
                index.push(obj.address(), entries.len);
                entries.push(CacheEntry {
                    address: obj.address(),
                    ty: obj.ty().clone(),
                    size: obj.size(),
                    refs,
                });
            }
        }

        info!("heap cache built: {} objects", entries.len);
        Ok(Self { entries, index })
    }

    /// Number of cached objects, sentinels included.
    pub fn len(&self) -> usize {
        self.entries.len
    }

    /// Whether the cache holds no objects at all.
    pub fn is_empty(&self) -> bool {
        self.entries.len == 0
    }

    /// The exact object starting at `addr`, if one was cached.
    pub fn index_of(&self, addr: Addr) -> Option<usize> {
        self.index.index_of(addr)
    }

    /// The cached type of the object starting exactly at `addr`.
    pub fn type_of(&self, addr: Addr) -> Option<&Arc<ClrType>> {
        self.index_of(addr)
            .and_then(|i| self.entries.get(i))
            .map(|entry| &entry.ty)
    }

    /// The object whose extent contains `addr` (an interior pointer), as
    /// `(start, type, size)`.
    pub fn containing_object(&self, addr: Addr) -> Option<(Addr, &Arc<ClrType>, u64)> {
        let entry = self.entries.get(self.index.index_at_or_below(addr)?)?;
        if addr < entry.address + entry.size {
            Some((entry.address, &entry.ty, entry.size))
        } else {
            None
        }
    }

    /// Cached outgoing references of the object starting exactly at
    /// `addr`, or `None` when no object was cached there.
    pub fn references_of(&self, addr: Addr) -> Option<&[ObjRef]> {
        self.index_of(addr)
            .and_then(|i| self.entries.get(i))
            .map(|entry| &*entry.refs)
    }

    /// All cached objects in ascending address order.
    pub fn enumerate(&self) -> impl Iterator<Item = (Addr, &Arc<ClrType>, u64)> {
        self.entries
            .iter()
            .map(|entry| (entry.address, &entry.ty, entry.size))
    }

    /// All cached objects in ascending address order, as owned values.
    ///
    /// The iterator keeps the cache alive on its own, so callers can hand
    /// it out without borrowing the cache slot it came from. No target
    /// memory is read.
    pub fn enumerate_objects(self: &Arc<Self>) -> impl Iterator<Item = ClrObject> + 'static {
        let cache = Arc::clone(self);
        let mut index = 0;
        std::iter::from_fn(move || {
            let entry = cache.entries.get(index)?;
            index += 1;
            Some(ClrObject::new(entry.address, entry.ty.clone(), entry.size))
        })
    }
}
