//! Raw memory access over the target.
//!
//! [`MemorySource`] is the single contract through which every higher layer
//! reads the target: a byte-range read that may be partial (a return of zero
//! means the address is unreadable) plus the target's pointer width. The
//! [`MemoryExt`] blanket extension layers typed reads on top of it.
//!
//! [`SnapshotMemory`] is the canonical implementation over pre-extracted
//! memory regions (what a dump reader produces), and [`CachedMemory`] wraps
//! any source with a small page-granular read cache for the point-read heavy
//! phases of heap walking.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A raw address in the target's address space.
pub type Addr = u64;

/// Page size used by [`CachedMemory`].
const CACHE_PAGE_SIZE: u64 = 0x1000;

/// Uniform read access to the target's address space.
///
/// Implementations must tolerate arbitrary addresses: reads of unmapped or
/// truncated regions return fewer bytes than requested (possibly zero) and
/// never fail any harder than that.
pub trait MemorySource: Send + Sync {
    /// Read up to `buf.len()` bytes at `addr`, returning the number of bytes
    /// actually read. Zero means the address is unreadable.
    fn read(&self, addr: Addr, buf: &mut [u8]) -> usize;

    /// Pointer width of the target in bytes (4 or 8).
    fn pointer_size(&self) -> u32;
}

impl<M: MemorySource + ?Sized> MemorySource for Arc<M> {
    fn read(&self, addr: Addr, buf: &mut [u8]) -> usize {
        (**self).read(addr, buf)
    }

    fn pointer_size(&self) -> u32 {
        (**self).pointer_size()
    }
}

/// Typed read helpers layered on the byte contract.
pub trait MemoryExt: MemorySource {
    /// Read exactly `buf.len()` bytes, or fail.
    fn read_exact(&self, addr: Addr, buf: &mut [u8]) -> bool {
        self.read(addr, buf) == buf.len()
    }

    /// Read a `u32`, or `None` if the range is unreadable.
    fn read_u32(&self, addr: Addr) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(addr, &mut buf)
            .then(|| u32::from_le_bytes(buf))
    }

    /// Read a `u64`, or `None` if the range is unreadable.
    fn read_u64(&self, addr: Addr) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(addr, &mut buf)
            .then(|| u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value, zero-extended to 64 bits.
    fn read_ptr(&self, addr: Addr) -> Option<Addr> {
        match self.pointer_size() {
            4 => self.read_u32(addr).map(u64::from),
            _ => self.read_u64(addr),
        }
    }

    /// Read `len` bytes into an owned buffer, or `None` on a short read.
    fn read_bytes(&self, addr: Addr, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(addr, &mut buf).then_some(buf)
    }
}

impl<M: MemorySource + ?Sized> MemoryExt for M {}

/// One contiguous captured region of the target's address space.
#[derive(Debug, Clone)]
struct Region {
    base: Addr,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> Addr {
        self.base + self.data.len() as u64
    }
}

/// A [`MemorySource`] over pre-extracted memory regions.
///
/// This is the shape a dump or core-file reader hands to the analysis core,
/// and also what the test suites use to lay out synthetic targets. Reads
/// that start inside a region but run past its end are partial; reads that
/// start outside every region return zero.
pub struct SnapshotMemory {
    regions: Vec<Region>,
    pointer_size: u32,
}

impl SnapshotMemory {
    /// Create an empty snapshot with the given pointer width.
    pub fn new(pointer_size: u32) -> Self {
        Self {
            regions: Vec::new(),
            pointer_size,
        }
    }

    /// Add a captured region. Regions must not overlap.
    pub fn add_region(&mut self, base: Addr, data: Vec<u8>) {
        debug_assert!(
            !self
                .regions
                .iter()
                .any(|r| base < r.end() && r.base < base + data.len() as u64),
            "overlapping snapshot regions"
        );
        self.regions.push(Region { base, data });
        self.regions.sort_by_key(|r| r.base);
    }

    /// Total bytes captured across all regions.
    pub fn captured_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.data.len()).sum()
    }

    fn region_containing(&self, addr: Addr) -> Option<&Region> {
        let idx = match self.regions.binary_search_by_key(&addr, |r| r.base) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let region = &self.regions[idx];
        (addr < region.end()).then_some(region)
    }
}

impl MemorySource for SnapshotMemory {
    fn read(&self, addr: Addr, buf: &mut [u8]) -> usize {
        let Some(region) = self.region_containing(addr) else {
            return 0;
        };
        let offset = (addr - region.base) as usize;
        let avail = region.data.len() - offset;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&region.data[offset..offset + n]);
        n
    }

    fn pointer_size(&self) -> u32 {
        self.pointer_size
    }
}

/// A page-granular read cache in front of another [`MemorySource`].
///
/// Heap walking performs millions of small point reads with strong spatial
/// locality; caching whole pages amortizes the underlying reader's per-call
/// cost. A cached page records the bytes readable from its start; ranges
/// the page entry cannot answer go straight to the underlying source, since
/// a captured region may begin or resume partway through a page.
pub struct CachedMemory<M> {
    inner: M,
    pages: Mutex<FxHashMap<Addr, Option<Box<[u8]>>>>,
}

impl<M: MemorySource> CachedMemory<M> {
    /// Wrap `inner` with a fresh, empty cache.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            pages: Mutex::new(FxHashMap::default()),
        }
    }

    /// Drop all cached pages.
    pub fn clear(&self) {
        self.pages.lock().clear();
    }

    fn read_via_cache(&self, addr: Addr, buf: &mut [u8]) -> usize {
        let mut total = 0;
        while total < buf.len() {
            let cur = addr + total as u64;
            let page_base = cur & !(CACHE_PAGE_SIZE - 1);
            let offset = (cur - page_base) as usize;
            let served = {
                let mut pages = self.pages.lock();
                let page = pages.entry(page_base).or_insert_with(|| {
                    let mut data = vec![0u8; CACHE_PAGE_SIZE as usize];
                    let n = self.inner.read(page_base, &mut data);
                    (n > 0).then(|| {
                        data.truncate(n);
                        data.into_boxed_slice()
                    })
                });
                match page {
                    Some(page) if offset < page.len() => {
                        let n = (buf.len() - total).min(page.len() - offset);
                        buf[total..total + n].copy_from_slice(&page[offset..offset + n]);
                        n
                    }
                    _ => 0,
                }
            };
            if served > 0 {
                total += served;
                continue;
            }
            // The page is short or unreadable from its start; that says
            // nothing about `cur`, because a captured region can begin
            // partway through a page. Ask the source directly.
            total += self.inner.read(cur, &mut buf[total..]);
            break;
        }
        total
    }
}

impl<M: MemorySource> MemorySource for CachedMemory<M> {
    fn read(&self, addr: Addr, buf: &mut [u8]) -> usize {
        self.read_via_cache(addr, buf)
    }

    fn pointer_size(&self) -> u32 {
        self.inner.pointer_size()
    }
}
