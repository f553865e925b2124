//! Heap segments and allocation contexts.

use clrscope_core::{Addr, Error, Result, SegmentData};
use rustc_hash::FxHashMap;

/// Collection treatment of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Normal (small-object) segment: pointer-size alignment.
    Normal,
    /// Large-object segment: 8-byte alignment, no compaction.
    Large,
}

/// One validated, immutable GC heap segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Start of the segment's reserved range.
    pub start: Addr,
    /// Address of the first object.
    pub first_object: Addr,
    /// End of the committed, object-bearing range. Walks stop here.
    pub committed_end: Addr,
    /// Hard end of the reserved range.
    pub end: Addr,
    /// Collection treatment.
    pub kind: SegmentKind,
}

impl Segment {
    /// Whether `addr` falls inside the segment's reserved range.
    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Large-object segment shorthand.
    pub fn is_large(&self) -> bool {
        self.kind == SegmentKind::Large
    }

    /// Reserved length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the segment reserves no space at all.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Sort and validate raw segment data into the walker's segment table.
///
/// Invariants enforced: ascending, non-overlapping starts
/// (`seg[i].end <= seg[i+1].start`), committed end within the hard end,
/// first object within the segment. Violations are fatal: a misordered
/// segment table would silently corrupt every address lookup.
pub fn build_segments(raw: Vec<SegmentData>) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = raw
        .into_iter()
        .map(|data| Segment {
            start: data.start,
            first_object: data.first_object,
            committed_end: data.committed_end,
            end: data.end,
            kind: if data.large {
                SegmentKind::Large
            } else {
                SegmentKind::Normal
            },
        })
        .collect();
    segments.sort_by_key(|seg| seg.start);

    for (i, seg) in segments.iter().enumerate() {
        if seg.first_object < seg.start || seg.first_object > seg.committed_end {
            return Err(Error::segments_out_of_order(
                i,
                format!(
                    "first object {:#x} outside [{:#x}, {:#x}]",
                    seg.first_object, seg.start, seg.committed_end
                ),
            ));
        }
        if seg.committed_end > seg.end {
            return Err(Error::segments_out_of_order(
                i,
                format!(
                    "committed end {:#x} beyond hard end {:#x}",
                    seg.committed_end, seg.end
                ),
            ));
        }
        if let Some(next) = segments.get(i + 1) {
            if seg.end > next.start {
                return Err(Error::segments_out_of_order(
                    i,
                    format!(
                        "segment end {:#x} overlaps next start {:#x}",
                        seg.end, next.start
                    ),
                ));
            }
        }
    }

    Ok(segments)
}

/// Thread-local allocation buffers, keyed by bump pointer.
///
/// When the walker's cursor lands exactly on a bump pointer, the range up
/// to the context's limit holds no objects and must be jumped over.
#[derive(Debug, Default)]
pub struct AllocationContexts {
    by_pointer: FxHashMap<Addr, Addr>,
}

impl AllocationContexts {
    /// Build the map, dropping null or inverted contexts.
    pub fn new(raw: Vec<(Addr, Addr)>) -> Self {
        let by_pointer = raw
            .into_iter()
            .filter(|&(ptr, limit)| ptr != 0 && limit > ptr)
            .collect();
        Self { by_pointer }
    }

    /// The limit of the context whose bump pointer is exactly `addr`.
    pub fn limit_for(&self, addr: Addr) -> Option<Addr> {
        self.by_pointer.get(&addr).copied()
    }

    /// Number of tracked contexts.
    pub fn len(&self) -> usize {
        self.by_pointer.len()
    }

    /// Whether no contexts are tracked.
    pub fn is_empty(&self) -> bool {
        self.by_pointer.is_empty()
    }
}
