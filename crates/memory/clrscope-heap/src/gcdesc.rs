//! GC descriptor decoding and instance walking.
//!
//! The runtime attaches a compact pointer map to every type whose instances
//! contain object references. The map lives immediately *below* the type's
//! method table: a signed series count one word under the handle, then the
//! series data at descending addresses.
//!
//! Two encodings exist:
//!
//! - count > 0: that many `(offset, size)` series. A series' stored size is
//!   biased by the instance size (the runtime stores `series_len - size` so
//!   the same descriptor serves variable-sized instances); the walker adds
//!   the actual object size back at enumeration time.
//! - count < 0: a repeating value-series for arrays of structs containing
//!   references. A single start offset is followed by `-count` items of
//!   `(pointer_run, skip)` pairs, applied cyclically per array element.
//!
//! Decoding happens once per type and the result is immutable. Walking is
//! defensively bounded: a corrupt count or offset can never push a read
//! past `object + size`, and any unreadable slot truncates the sequence
//! silently (partial dumps are routine).

use clrscope_core::{Addr, MemoryExt, MemorySource};
use log::debug;

/// Guard against corrupt series counts.
const MAX_SERIES: i64 = 4096;

/// One pointer series: `size_bias + instance_size` bytes of consecutive
/// pointer slots starting at `offset`.
#[derive(Debug, Clone, Copy)]
struct GcRun {
    offset: u64,
    size_bias: i64,
}

/// One item of a repeating value-series: `nptrs` pointer slots, then
/// `skip` bytes of non-pointer data.
#[derive(Debug, Clone, Copy)]
struct ValueSeries {
    nptrs: u32,
    skip: u32,
}

#[derive(Debug, Clone)]
enum MapKind {
    Runs(Vec<GcRun>),
    Repeat { offset: u64, items: Vec<ValueSeries> },
}

/// A decoded, immutable GC pointer map.
#[derive(Debug, Clone)]
pub struct GcMap {
    kind: MapKind,
}

impl GcMap {
    /// Decode the descriptor below `handle`, or `None` if the memory is
    /// unreadable or structurally implausible.
    pub fn decode(mem: &dyn MemorySource, handle: Addr) -> Option<GcMap> {
        let word = u64::from(mem.pointer_size());
        let count = read_word_signed(mem, handle.checked_sub(word)?)?;
        if count == 0 || count.abs() > MAX_SERIES {
            if count != 0 {
                debug!("implausible GC descriptor series count {count} below {handle:#x}");
            }
            return None;
        }

        if count > 0 {
            let mut runs = Vec::with_capacity(count as usize);
            for j in 0..count as u64 {
                let offset = read_word(mem, handle.checked_sub(word * (2 + 2 * j))?)?;
                let size_bias =
                    read_word_signed(mem, handle.checked_sub(word * (3 + 2 * j))?)?;
                runs.push(GcRun { offset, size_bias });
            }
            Some(GcMap {
                kind: MapKind::Runs(runs),
            })
        } else {
            let offset = read_word(mem, handle.checked_sub(word * 2)?)?;
            let count = (-count) as u64;
            let mut items = Vec::with_capacity(count as usize);
            for k in 0..count {
                let base = handle.checked_sub(word * 2 + 8 * (k + 1))?;
                let nptrs = mem.read_u32(base)?;
                let skip = mem.read_u32(base + 4)?;
                items.push(ValueSeries { nptrs, skip });
            }
            // A cycle that advances zero bytes would walk forever.
            let stride: u64 = items
                .iter()
                .map(|item| u64::from(item.nptrs) * word + u64::from(item.skip))
                .sum();
            if stride == 0 {
                debug!("degenerate repeating GC descriptor below {handle:#x}");
                return None;
            }
            Some(GcMap {
                kind: MapKind::Repeat { offset, items },
            })
        }
    }

    /// Whether the map describes no pointer slots at all.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            MapKind::Runs(runs) => runs.is_empty(),
            MapKind::Repeat { items, .. } => items.iter().all(|item| item.nptrs == 0),
        }
    }

    /// Lazily enumerate `(target, offset)` for every non-null pointer slot
    /// of the instance at `obj` with total size `size`.
    ///
    /// `read_ptr` failures end the walk early; reads never move past
    /// `obj + size` regardless of what the descriptor claims. The returned
    /// iterator owns its copy of the map and does not borrow `self`.
    pub fn walk_object<F>(
        &self,
        obj: Addr,
        size: u64,
        pointer_size: u32,
        read_ptr: F,
    ) -> ObjectRefWalk<F>
    where
        F: FnMut(Addr) -> Option<Addr>,
    {
        let word = u64::from(pointer_size);
        let end = obj.saturating_add(size);
        let state = match &self.kind {
            MapKind::Runs(_) => WalkState::Runs {
                next_run: 0,
                cur: 0,
                stop: 0,
            },
            MapKind::Repeat { offset, items } => WalkState::Repeat {
                item: 0,
                remaining: items.first().map_or(0, |item| item.nptrs),
                cur: obj.saturating_add(*offset),
                limit: end,
            },
        };
        ObjectRefWalk {
            map: self.kind.clone(),
            read_ptr,
            word,
            obj,
            end,
            done: false,
            state,
        }
    }
}

enum WalkState {
    Runs { next_run: usize, cur: Addr, stop: Addr },
    Repeat { item: usize, remaining: u32, cur: Addr, limit: Addr },
}

/// Lazy pointer-slot enumeration over one object instance.
pub struct ObjectRefWalk<F> {
    map: MapKind,
    read_ptr: F,
    word: u64,
    obj: Addr,
    end: Addr,
    done: bool,
    state: WalkState,
}

impl<F> Iterator for ObjectRefWalk<F>
where
    F: FnMut(Addr) -> Option<Addr>,
{
    type Item = (Addr, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            // Find the next slot to read, advancing series state as needed.
            let slot = match &mut self.state {
                WalkState::Runs { next_run, cur, stop } => {
                    if *cur < *stop {
                        let slot = *cur;
                        *cur += self.word;
                        slot
                    } else {
                        let MapKind::Runs(runs) = &self.map else {
                            unreachable!()
                        };
                        let Some(run) = runs.get(*next_run) else {
                            self.done = true;
                            return None;
                        };
                        *next_run += 1;
                        let start = self.obj.saturating_add(run.offset);
                        // Stored size is biased by the instance size.
                        let len = (self.end - self.obj) as i64 + run.size_bias;
                        *stop = if len > 0 {
                            start.saturating_add(len as u64).min(self.end)
                        } else {
                            start
                        };
                        *cur = start;
                        continue;
                    }
                }
                WalkState::Repeat {
                    item,
                    remaining,
                    cur,
                    limit,
                } => {
                    // A slot ending exactly at the limit is still in bounds.
                    if cur.saturating_add(self.word) > *limit {
                        self.done = true;
                        return None;
                    }
                    let MapKind::Repeat { items, .. } = &self.map else {
                        unreachable!()
                    };
                    if *remaining > 0 {
                        let slot = *cur;
                        *remaining -= 1;
                        *cur += self.word;
                        slot
                    } else {
                        *cur = cur.saturating_add(u64::from(items[*item].skip));
                        *item = (*item + 1) % items.len();
                        *remaining = items[*item].nptrs;
                        continue;
                    }
                }
            };

            let Some(value) = (self.read_ptr)(slot) else {
                // Unreadable memory truncates the walk, it never fails it.
                self.done = true;
                return None;
            };
            if value != 0 {
                return Some((value, slot - self.obj));
            }
        }
    }
}

fn read_word(mem: &dyn MemorySource, addr: Addr) -> Option<u64> {
    mem.read_ptr(addr)
}

fn read_word_signed(mem: &dyn MemorySource, addr: Addr) -> Option<i64> {
    match mem.pointer_size() {
        4 => mem.read_u32(addr).map(|v| i64::from(v as i32)),
        _ => mem.read_u64(addr).map(|v| v as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TargetBuilder;
    use clrscope_core::MemoryExt;

    const MT: Addr = 0x10_0000;
    const OBJ: Addr = 0x20_0000;

    #[test]
    fn test_decode_missing_descriptor() {
        let mem = TargetBuilder::new(8).finish();
        assert!(GcMap::decode(&mem, MT).is_none());
    }

    #[test]
    fn test_runs_yield_declared_slots_only() {
        let mut target = TargetBuilder::new(8);
        // One series covering two slots at offsets 8 and 16 of a 40-byte
        // object: stored bias = series_len - size = 16 - 40 = -24.
        target.gcdesc_runs(MT, &[(8, -24)]);
        target.poke_u64(OBJ + 8, 0x111);
        target.poke_u64(OBJ + 16, 0x222);
        target.poke_u64(OBJ + 24, 0x333); // not part of the series
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        let refs: Vec<_> = map
            .walk_object(OBJ, 40, 8, |addr| mem.read_ptr(addr))
            .collect();
        assert_eq!(refs, vec![(0x111, 8), (0x222, 16)]);
    }

    #[test]
    fn test_null_slots_skipped() {
        let mut target = TargetBuilder::new(8);
        target.gcdesc_runs(MT, &[(8, -24)]);
        target.poke_u64(OBJ + 8, 0);
        target.poke_u64(OBJ + 16, 0x222);
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        let refs: Vec<_> = map
            .walk_object(OBJ, 40, 8, |addr| mem.read_ptr(addr))
            .collect();
        assert_eq!(refs, vec![(0x222, 16)]);
    }

    #[test]
    fn test_corrupt_series_cannot_escape_object() {
        let mut target = TargetBuilder::new(8);
        // Bias claims the series extends far past the object.
        target.gcdesc_runs(MT, &[(8, 4096)]);
        for slot in (8..64).step_by(8) {
            target.poke_u64(OBJ + slot, 0x999);
        }
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        let refs: Vec<_> = map
            .walk_object(OBJ, 32, 8, |addr| mem.read_ptr(addr))
            .collect();
        assert!(refs.iter().all(|&(_, offset)| offset + 8 <= 32));
    }

    #[test]
    fn test_unreadable_slot_truncates_silently() {
        let mut target = TargetBuilder::new(8);
        target.gcdesc_runs(MT, &[(8, -24)]);
        target.poke_u64(OBJ + 8, 0x111);
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        // Reads beyond the first slot report unreadable.
        let refs: Vec<_> = map
            .walk_object(OBJ, 40, 8, |addr| (addr == OBJ + 8).then_some(0x111))
            .collect();
        assert_eq!(refs, vec![(0x111, 8)]);
    }

    #[test]
    fn test_repeating_series_per_element() {
        let mut target = TargetBuilder::new(8);
        // Array-style: elements of 16 bytes each (one pointer, 8 bytes
        // skipped), data starting at offset 16.
        target.gcdesc_repeat(MT, 16, &[(1, 8)]);
        let size = 16 + 3 * 16u64;
        for i in 0..3u64 {
            target.poke_u64(OBJ + 16 + i * 16, 0x1000 + i);
        }
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        let refs: Vec<_> = map
            .walk_object(OBJ, size, 8, |addr| mem.read_ptr(addr))
            .collect();
        assert_eq!(
            refs,
            vec![(0x1000, 16), (0x1001, 32), (0x1002, 48)]
        );
    }

    #[test]
    fn test_repeat_series_covers_the_final_word() {
        let mut target = TargetBuilder::new(8);
        // Pure pointer array: one pointer per element, nothing skipped.
        // The last element occupies the object's final word.
        target.gcdesc_repeat(MT, 16, &[(1, 0)]);
        for i in 0..3u64 {
            target.poke_u64(OBJ + 16 + i * 8, 0x1000 + i);
        }
        let mem = target.finish();

        let map = GcMap::decode(&mem, MT).unwrap();
        let refs: Vec<_> = map
            .walk_object(OBJ, 40, 8, |addr| mem.read_ptr(addr))
            .collect();
        assert_eq!(refs, vec![(0x1000, 16), (0x1001, 24), (0x1002, 32)]);
    }

    #[test]
    fn test_degenerate_repeat_rejected() {
        let mut target = TargetBuilder::new(8);
        target.gcdesc_repeat(MT, 16, &[(0, 0)]);
        let mem = target.finish();
        assert!(GcMap::decode(&mem, MT).is_none());
    }
}
