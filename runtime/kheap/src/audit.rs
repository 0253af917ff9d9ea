//! Whole-heap consistency check
//!
//! Walks the region physically and every list logically, and cross-checks
//! both against the allocation bitmap. Too slow for the fast path; the
//! kernel runs it from the shell and the tests run it after every step.

use crate::bins::{bin_index, BinTable, ListId, ListKind, Slot};
use crate::chunk::{self, Chunk};
use crate::config::{GRANULE, MIN_ALLOC_BYTES};
use crate::error::{HeapError, Result};
use crate::heap::Heap;

impl Heap<'_> {
    /// Verify every structural invariant of the heap.
    ///
    /// # Errors
    /// `CorruptState` naming the first offending offset.
    pub fn check_invariants(&self) -> Result<()> {
        let live = self.check_physical()?;
        let listed = self.check_lists()?;

        if listed.chunks != live.free_chunks {
            return Err(HeapError::corrupt(0, "free chunk missing from every list"));
        }
        if listed.remainders > 1 {
            return Err(HeapError::corrupt(0, "remainder cache holds several chunks"));
        }
        if self.bitmap.count_set(self.arena.len() / GRANULE) != live.allocated_chunks {
            return Err(HeapError::corrupt(0, "bitmap count disagrees with live chunks"));
        }
        if self.stats().in_use != live.allocated_bytes {
            return Err(HeapError::corrupt(0, "usage counter drifted"));
        }
        Ok(())
    }

    fn check_physical(&self) -> Result<PhysicalSummary> {
        let mut summary = PhysicalSummary::default();
        let mut covered = 0;

        for item in self.chunks() {
            let (chunk, tag) = item?;
            if chunk.offset() != covered {
                return Err(HeapError::corrupt(covered, "gap in physical walk"));
            }
            covered += tag.size;

            let marked = self.bitmap.is_set(chunk.offset() / GRANULE);
            if tag.free {
                if marked {
                    return Err(HeapError::corrupt(chunk.offset(), "free chunk marked live"));
                }
                summary.free_chunks += 1;
            } else {
                if !marked {
                    return Err(HeapError::corrupt(chunk.offset(), "live chunk not marked"));
                }
                summary.allocated_chunks += 1;
                summary.allocated_bytes += tag.size;
            }
        }

        if covered != self.arena.len() {
            return Err(HeapError::corrupt(covered, "chunks do not cover the region"));
        }
        Ok(summary)
    }

    fn check_lists(&self) -> Result<ListSummary> {
        let mut summary = ListSummary::default();
        let budget = self.arena.len() / MIN_ALLOC_BYTES;

        for list in BinTable::lists() {
            let mut expected = Slot::Head(list);
            let mut last: Option<Chunk> = None;
            let mut cur = self.bins.head(list);

            while let Some(c) = cur {
                if summary.chunks >= budget {
                    return Err(HeapError::corrupt(c.offset(), "free list cycle"));
                }
                let tag = chunk::read_tag(&self.arena, c)?;
                if !tag.free {
                    return Err(HeapError::corrupt(c.offset(), "allocated chunk on a free list"));
                }
                if self.bins.slot_of(&self.arena, c) != Some(expected) {
                    return Err(HeapError::corrupt(c.offset(), "stale back-reference"));
                }
                if list.bin() > 0 && bin_index(tag.size) != list.bin() {
                    return Err(HeapError::corrupt(c.offset(), "chunk filed in the wrong bin"));
                }
                if list != ListId::RECENT && last.is_some_and(|prev| prev >= c) {
                    return Err(HeapError::corrupt(c.offset(), "list out of address order"));
                }
                if list == ListId::REMAINDER {
                    summary.remainders += 1;
                }
                if list.bin() > 0 && list.kind() == ListKind::Clean {
                    self.check_maximal(c, tag.size)?;
                }

                summary.chunks += 1;
                expected = Slot::Next(c);
                last = Some(c);
                cur = self.bins.next(&self.arena, c);
            }
        }
        Ok(summary)
    }

    /// A clean chunk has no free neighbour that is also clean.
    fn check_maximal(&self, c: Chunk, size: usize) -> Result<()> {
        if let Some(succ) = chunk::successor(&self.arena, c, size) {
            if chunk::read_tag(&self.arena, succ)?.free && self.on_clean_list(succ) {
                return Err(HeapError::corrupt(c.offset(), "adjacent clean chunks"));
            }
        }
        Ok(())
    }

    fn on_clean_list(&self, c: Chunk) -> bool {
        let mut slot = self.bins.slot_of(&self.arena, c);
        let mut hops = self.arena.len() / MIN_ALLOC_BYTES;
        while let Some(Slot::Next(prev)) = slot {
            if hops == 0 {
                return false;
            }
            hops -= 1;
            slot = self.bins.slot_of(&self.arena, prev);
        }
        matches!(slot, Some(Slot::Head(l)) if l.bin() > 0 && l.kind() == ListKind::Clean)
    }
}

#[derive(Default)]
struct PhysicalSummary {
    free_chunks: usize,
    allocated_chunks: usize,
    allocated_bytes: usize,
}

#[derive(Default)]
struct ListSummary {
    chunks: usize,
    remainders: usize,
}
