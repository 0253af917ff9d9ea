//! Heap core: allocation search, coalescing and free
//!
//! `Heap` is the unlocked allocator. It owns the region, the bin table and
//! the allocation bitmap; [`crate::KernelHeap`] wraps it in the kernel lock.
//!
//! # Allocation search
//! A padded request walks, in order:
//! 1. the head of the recent cache (near-exact size)
//! 2. the dirty list of its own bin (exact size)
//! 3. the whole recent cache (exact size), evicting misses into dirty bins
//! 4. the remainder cache (first fit)
//! 5. the clean list of its own bin (first fit)
//! 6. the clean lists of every larger bin (first fit)
//! 7. a full coalescing pass, then 4 to 6 again
//!
//! Hits from steps 4 to 7 are split; the tail becomes the new remainder.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::bins::{bin_index, BinMode, BinTable, ListId};
use crate::bitmap::{AllocBitmap, MAX_BITS};
use crate::chunk::{self, Chunk};
use crate::config::{
    ALIGN, BIN_COUNT, CHUNK_OVERHEAD, GRANULE, MAX_REGION_BYTES, MIN_ALLOC_BYTES, PRESPLIT_COUNT,
    TAG_BYTES,
};
use crate::error::{HeapError, InvalidFreeReason, Result};
use crate::tag::{Owner, Tag};

/// Snapshot of heap usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Managed bytes (after trimming to the granule grid)
    pub region_bytes: usize,
    /// Bytes held by live chunks, tags included
    pub in_use: usize,
    /// Bytes held by free chunks, tags included
    pub free_bytes: usize,
    /// Largest `in_use` ever observed
    pub high_water: usize,
    pub allocations: u64,
    pub frees: u64,
    /// Requests that ended in out-of-memory
    pub failed: u64,
    pub free_chunks: usize,
    pub largest_free: usize,
}

#[derive(Default)]
struct Counters {
    in_use: usize,
    high_water: usize,
    allocations: u64,
    frees: u64,
    failed: u64,
}

/// Boundary-tag heap over one fixed region
pub struct Heap<'a> {
    pub(crate) arena: Arena<'a>,
    pub(crate) bins: BinTable,
    pub(crate) bitmap: AllocBitmap,
    last_alloc_size: usize,
    counters: Counters,
}

impl<'a> Heap<'a> {
    /// Take over `region` as the heap.
    ///
    /// The region is trimmed to the granule grid and becomes a single clean
    /// chunk.
    ///
    /// # Errors
    /// - `RegionTooSmall` if fewer than `MIN_ALLOC_BYTES` remain after trimming
    /// - `RegionTooLarge` if the bitmap cannot cover the region
    pub fn new(region: &'a mut [u8]) -> Result<Self> {
        let raw_len = region.len();
        let mut arena = Arena::new(region);
        let len = arena.len();

        if len < MIN_ALLOC_BYTES {
            return Err(HeapError::RegionTooSmall { size: raw_len });
        }
        if len > MAX_REGION_BYTES || len / GRANULE > MAX_BITS {
            return Err(HeapError::RegionTooLarge {
                size: len,
                max: MAX_REGION_BYTES,
            });
        }

        let mut bins = BinTable::new();
        let first = chunk::init_chunk(&mut arena, 0, len);
        bins.bin_chunk(&mut arena, first, len, BinMode::Clean);

        log::debug!(
            "[kheap] region {:#x} - {:#x} ({}KB), first chunk in bin {}",
            arena.base_addr(),
            arena.end_addr(),
            len / 1024,
            bin_index(len)
        );

        Ok(Self {
            arena,
            bins,
            bitmap: AllocBitmap::new(),
            last_alloc_size: 0,
            counters: Counters::default(),
        })
    }

    /// Managed region length in bytes
    pub fn region_len(&self) -> usize {
        self.arena.len()
    }

    /// Address of the first managed byte
    pub fn base_addr(&self) -> usize {
        self.arena.base_addr()
    }

    /// Chunk size needed for a request of `size` payload bytes
    pub fn padded_size(size: usize) -> Option<usize> {
        let padded = size.checked_add(CHUNK_OVERHEAD)?.max(MIN_ALLOC_BYTES);
        padded.checked_next_multiple_of(GRANULE)
    }

    /// Allocate `size` zeroed bytes stamped with `owner`.
    ///
    /// # Errors
    /// `OutOfMemory` when no chunk fits after coalescing; `CorruptState` if
    /// the search trips over a damaged tag or list.
    pub fn allocate(&mut self, size: usize, owner: Owner) -> Result<NonNull<u8>> {
        let chunk_size = match Self::padded_size(size) {
            Some(s) if s <= self.arena.len() => s,
            _ => return Err(self.out_of_memory(size)),
        };

        let Some(chunk) = self.allocate_chunk(chunk_size)? else {
            return Err(self.out_of_memory(size));
        };

        let granted = chunk::read_tag(&self.arena, chunk)?.size;
        chunk::write_tags(&mut self.arena, chunk, Tag::allocated(granted, owner));
        self.arena.zero(chunk.payload(), granted - CHUNK_OVERHEAD);
        self.bitmap.set(chunk.offset() / GRANULE);

        self.counters.in_use += granted;
        self.counters.high_water = self.counters.high_water.max(self.counters.in_use);
        self.counters.allocations += 1;
        self.last_alloc_size = chunk_size;

        Ok(self.arena.ptr_at(chunk.payload()))
    }

    fn out_of_memory(&mut self, size: usize) -> HeapError {
        self.counters.failed += 1;
        log::warn!(
            "[kheap] out of memory: {} bytes requested, {} of {} in use",
            size,
            self.counters.in_use,
            self.arena.len()
        );
        HeapError::OutOfMemory { requested: size }
    }

    /// Return a chunk to the recent cache.
    ///
    /// `None` is a no-op. No merging happens here; neighbours are
    /// coalesced by a later search or by [`Heap::coalesce_all`].
    ///
    /// # Errors
    /// `InvalidFree` if `ptr` is not a live allocation of this heap.
    pub fn free(&mut self, ptr: Option<NonNull<u8>>) -> Result<()> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        let (chunk, tag) = self.live_chunk(ptr)?;

        chunk::write_tags(&mut self.arena, chunk, Tag { free: true, ..tag });
        chunk::clear_links(&mut self.arena, chunk);
        self.bitmap.clear(chunk.offset() / GRANULE);
        self.bins
            .bin_chunk(&mut self.arena, chunk, tag.size, BinMode::Recent);

        self.counters.in_use -= tag.size;
        self.counters.frees += 1;
        Ok(())
    }

    /// Payload bytes available behind a live pointer
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.live_chunk(ptr).map(|(_, tag)| tag.size - CHUNK_OVERHEAD)
    }

    /// Validate a caller pointer and resolve it to its chunk
    fn live_chunk(&self, ptr: NonNull<u8>) -> Result<(Chunk, Tag)> {
        let addr = ptr.as_ptr() as usize;
        let invalid = |reason| HeapError::InvalidFree { addr, reason };

        if addr % ALIGN != 0 {
            return Err(invalid(InvalidFreeReason::Misaligned));
        }
        let payload = self
            .arena
            .offset_of(addr)
            .filter(|&off| off >= TAG_BYTES)
            .ok_or(invalid(InvalidFreeReason::OutOfRegion))?;
        let offset = payload - TAG_BYTES;
        if offset % GRANULE != 0 {
            return Err(invalid(InvalidFreeReason::Misaligned));
        }
        if !self.bitmap.is_set(offset / GRANULE) {
            return Err(invalid(InvalidFreeReason::NotAllocated));
        }

        let chunk = Chunk::at(offset);
        let tag = chunk::read_tag(&self.arena, chunk)?;
        if tag.free {
            return Err(HeapError::corrupt(offset, "bitmap marks a free chunk live"));
        }
        Ok((chunk, tag))
    }

    /// Find and detach a chunk of at least `size` bytes (already padded).
    pub(crate) fn allocate_chunk(&mut self, size: usize) -> Result<Option<Chunk>> {
        let bin = bin_index(size);

        if let Some(c) = self.bins.head(ListId::RECENT) {
            let have = self.size_of(c)?;
            if have >= size && have < size + MIN_ALLOC_BYTES {
                self.bins.unlink_chunk(&mut self.arena, c)?;
                log::trace!("[kheap] {} bytes from recent head", size);
                return Ok(Some(c));
            }
        }

        if let Some(c) = self.find_exact(ListId::dirty(bin), size)? {
            self.bins.unlink_chunk(&mut self.arena, c)?;
            log::trace!("[kheap] {} bytes from dirty bin {}", size, bin);
            return Ok(Some(c));
        }

        if let Some(c) = self.drain_recent_for(size)? {
            log::trace!("[kheap] {} bytes from recent cache", size);
            return Ok(Some(c));
        }

        if let Some(c) = self.first_fit(size, bin)? {
            return self.carve(c, size).map(Some);
        }

        self.coalesce_all()?;
        if let Some(c) = self.first_fit(size, bin)? {
            log::trace!("[kheap] {} bytes after coalescing", size);
            return self.carve(c, size).map(Some);
        }

        Ok(None)
    }

    fn size_of(&self, chunk: Chunk) -> Result<usize> {
        chunk::read_tag(&self.arena, chunk).map(|t| t.size)
    }

    fn find_exact(&self, list: ListId, size: usize) -> Result<Option<Chunk>> {
        let mut cur = self.bins.head(list);
        while let Some(c) = cur {
            if self.size_of(c)? == size {
                return Ok(Some(c));
            }
            cur = self.bins.next(&self.arena, c);
        }
        Ok(None)
    }

    fn find_fit(&self, list: ListId, size: usize) -> Result<Option<Chunk>> {
        let mut cur = self.bins.head(list);
        while let Some(c) = cur {
            if self.size_of(c)? >= size {
                return Ok(Some(c));
            }
            cur = self.bins.next(&self.arena, c);
        }
        Ok(None)
    }

    /// Scan the recent cache for an exact fit, moving every miss it passes
    /// into its dirty bin.
    fn drain_recent_for(&mut self, size: usize) -> Result<Option<Chunk>> {
        while let Some(c) = self.bins.pop(&mut self.arena, ListId::RECENT)? {
            let have = self.size_of(c)?;
            if have == size {
                return Ok(Some(c));
            }
            self.bins.bin_chunk(&mut self.arena, c, have, BinMode::Dirty);
        }
        Ok(None)
    }

    /// First fit over remainder, own clean bin, then larger clean bins.
    /// The hit is unlinked.
    fn first_fit(&mut self, size: usize, bin: usize) -> Result<Option<Chunk>> {
        let mut hit = self.find_fit(ListId::REMAINDER, size)?;
        let mut b = bin;
        while hit.is_none() && b < BIN_COUNT {
            hit = self.find_fit(ListId::clean(b), size)?;
            b += 1;
        }

        if let Some(c) = hit {
            self.bins.unlink_chunk(&mut self.arena, c)?;
        }
        Ok(hit)
    }

    /// Cut `size` bytes off an unlinked free chunk.
    ///
    /// A tail smaller than a minimum chunk stays attached and the caller
    /// gets the whole chunk.
    fn carve(&mut self, chunk: Chunk, size: usize) -> Result<Chunk> {
        let total = self.size_of(chunk)?;
        if total - size < MIN_ALLOC_BYTES {
            return Ok(chunk);
        }

        let (head, rest) = chunk::split_chunk(&mut self.arena, chunk, size)?;
        self.stash_remainder(rest, total - size)?;

        if size == self.last_alloc_size {
            self.presplit(size)?;
        }
        Ok(head)
    }

    /// Make `rest` the remainder, filing any previous remainder as clean.
    fn stash_remainder(&mut self, rest: Chunk, size: usize) -> Result<()> {
        if let Some(old) = self.bins.pop(&mut self.arena, ListId::REMAINDER)? {
            let old_size = self.size_of(old)?;
            self.bins
                .bin_chunk(&mut self.arena, old, old_size, BinMode::Clean);
        }
        self.bins
            .bin_chunk(&mut self.arena, rest, size, BinMode::Remainder);
        Ok(())
    }

    /// Same size as last time: pre-carve a few more for the recent cache.
    fn presplit(&mut self, size: usize) -> Result<()> {
        for _ in 0..PRESPLIT_COUNT {
            let Some(rem) = self.bins.head(ListId::REMAINDER) else {
                break;
            };
            let have = self.size_of(rem)?;
            if have < size + MIN_ALLOC_BYTES {
                break;
            }

            self.bins.unlink_chunk(&mut self.arena, rem)?;
            let (piece, rest) = chunk::split_chunk(&mut self.arena, rem, size)?;
            self.bins
                .bin_chunk(&mut self.arena, piece, size, BinMode::Recent);
            self.bins
                .bin_chunk(&mut self.arena, rest, have - size, BinMode::Remainder);
        }
        Ok(())
    }

    /// Flush the recent cache into the dirty bins and coalesce every dirty
    /// list. Afterwards no two free chunks are physically adjacent.
    pub fn coalesce_all(&mut self) -> Result<()> {
        let mut flushed = 0usize;
        while let Some(c) = self.bins.pop(&mut self.arena, ListId::RECENT)? {
            let size = self.size_of(c)?;
            self.bins.bin_chunk(&mut self.arena, c, size, BinMode::Dirty);
            flushed += 1;
        }

        let mut merged = 0usize;
        for bin in 1..BIN_COUNT {
            merged += self.coalesce_list(ListId::dirty(bin))?;
        }

        log::debug!(
            "[kheap] coalesce: {} flushed from recent, {} dirty chunks processed",
            flushed,
            merged
        );
        Ok(())
    }

    /// Merge every chunk of a dirty list with its free physical neighbours
    /// and file the results as clean. Returns the number of chunks taken off
    /// the list.
    pub(crate) fn coalesce_list(&mut self, list: ListId) -> Result<usize> {
        let mut processed = 0;
        while let Some(c) = self.bins.pop(&mut self.arena, list)? {
            self.merge_neighbors(c)?;
            processed += 1;
        }
        Ok(processed)
    }

    fn merge_neighbors(&mut self, chunk: Chunk) -> Result<()> {
        let tag = chunk::read_tag(&self.arena, chunk)?;
        if !tag.free {
            return Err(HeapError::corrupt(chunk.offset(), "allocated chunk on a free list"));
        }

        let mut start = chunk;
        let mut size = tag.size;

        // A dirty neighbour may itself border further free chunks.
        while let Some(pred) = chunk::predecessor(&self.arena, start)? {
            let pred_tag = chunk::read_tag(&self.arena, pred)?;
            if !pred_tag.free {
                break;
            }
            self.bins.unlink_chunk(&mut self.arena, pred)?;
            start = pred;
            size += pred_tag.size;
        }

        while let Some(succ) = chunk::successor(&self.arena, start, size) {
            let succ_tag = chunk::read_tag(&self.arena, succ)?;
            if !succ_tag.free {
                break;
            }
            self.bins.unlink_chunk(&mut self.arena, succ)?;
            size += succ_tag.size;
        }

        let merged = chunk::init_chunk(&mut self.arena, start.offset(), size);
        self.bins
            .bin_chunk(&mut self.arena, merged, size, BinMode::Clean);
        Ok(())
    }

    /// Walk every chunk in address order
    pub(crate) fn chunks(&self) -> PhysicalWalk<'_, 'a> {
        PhysicalWalk {
            heap: self,
            offset: 0,
        }
    }

    /// Visit every readable tag in address order. A damaged tag ends the
    /// walk; it is logged and the chunks before it still count.
    fn visit_tags(&self, mut f: impl FnMut(Tag)) {
        for item in self.chunks() {
            match item {
                Ok((_, tag)) => f(tag),
                Err(e) => {
                    log::error!("[kheap] chunk walk stopped: {}", e);
                    break;
                }
            }
        }
    }

    /// Bytes held by live chunks stamped with `owner`
    ///
    /// On a corrupted heap this only counts the chunks in front of the
    /// damage; `check_invariants` reports the fault itself.
    pub fn owned_by(&self, owner: Owner) -> usize {
        let mut bytes = 0;
        self.visit_tags(|tag| {
            if !tag.free && tag.owner == owner {
                bytes += tag.size;
            }
        });
        bytes
    }

    pub fn stats(&self) -> HeapStats {
        let mut free_chunks = 0;
        let mut largest_free = 0;
        self.visit_tags(|tag| {
            if tag.free {
                free_chunks += 1;
                largest_free = largest_free.max(tag.size);
            }
        });

        HeapStats {
            region_bytes: self.arena.len(),
            in_use: self.counters.in_use,
            free_bytes: self.arena.len() - self.counters.in_use,
            high_water: self.counters.high_water,
            allocations: self.counters.allocations,
            frees: self.counters.frees,
            failed: self.counters.failed,
            free_chunks,
            largest_free,
        }
    }
}

/// Address-order walk over the region; yields one error and stops if a tag
/// is damaged.
pub(crate) struct PhysicalWalk<'h, 'a> {
    heap: &'h Heap<'a>,
    offset: usize,
}

impl Iterator for PhysicalWalk<'_, '_> {
    type Item = Result<(Chunk, Tag)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.heap.arena.len() {
            return None;
        }
        let chunk = Chunk::at(self.offset);
        match chunk::read_tag(&self.heap.arena, chunk) {
            Ok(tag) => {
                self.offset += tag.size;
                Some(Ok((chunk, tag)))
            }
            Err(e) => {
                self.offset = self.heap.arena.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    fn region(bytes: usize) -> &'static mut [u8] {
        let raw = Box::leak(vec![0u8; bytes + GRANULE].into_boxed_slice());
        let lead = raw.as_ptr().align_offset(GRANULE);
        &mut raw[lead..lead + bytes]
    }

    fn heap(bytes: usize) -> Heap<'static> {
        Heap::new(region(bytes)).unwrap()
    }

    fn offset_of(heap: &Heap<'_>, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize - heap.base_addr() - TAG_BYTES
    }

    #[test]
    fn test_new_places_single_clean_chunk() {
        let h = heap(4096);
        let list = ListId::clean(bin_index(4096));
        assert_eq!(h.bins.head(list), Some(Chunk::at(0)));
        assert_eq!(h.stats().free_chunks, 1);
        assert_eq!(h.stats().largest_free, 4096);
    }

    #[test]
    fn test_region_limits() {
        assert!(matches!(
            Heap::new(region(GRANULE)),
            Err(HeapError::RegionTooSmall { .. })
        ));
        assert!(matches!(
            Heap::new(region(MAX_REGION_BYTES + 4096)),
            Err(HeapError::RegionTooLarge { .. })
        ));
    }

    #[test]
    fn test_padded_size() {
        assert_eq!(Heap::padded_size(0), Some(MIN_ALLOC_BYTES));
        assert_eq!(Heap::padded_size(16), Some(MIN_ALLOC_BYTES));
        assert_eq!(Heap::padded_size(17), Some(48));
        assert_eq!(Heap::padded_size(100), Some(128));
        assert_eq!(Heap::padded_size(usize::MAX), None);
    }

    #[test]
    fn test_first_allocation_splits_into_remainder() {
        let mut h = heap(4096);
        let p = h.allocate(100, Owner::KERNEL).unwrap();
        assert_eq!(offset_of(&h, p), 0);

        let rem = h.bins.head(ListId::REMAINDER).unwrap();
        assert_eq!(rem.offset(), 128);
        assert_eq!(h.size_of(rem).unwrap(), 4096 - 128);
    }

    #[test]
    fn test_free_goes_to_recent_and_is_reused() {
        let mut h = heap(4096);
        let a = h.allocate(64, Owner::KERNEL).unwrap();
        let _b = h.allocate(200, Owner::KERNEL).unwrap();

        h.free(Some(a)).unwrap();
        assert_eq!(h.bins.head(ListId::RECENT).map(Chunk::offset), Some(offset_of(&h, a)));

        let c = h.allocate(64, Owner::KERNEL).unwrap();
        assert_eq!(c, a);
        assert!(h.bins.is_empty(ListId::RECENT));
    }

    #[test]
    fn test_recent_head_near_exact_match() {
        let mut h = heap(4096);
        let a = h.allocate(48, Owner::KERNEL).unwrap(); // 64-byte chunk
        let _guard = h.allocate(500, Owner::KERNEL).unwrap();
        h.free(Some(a)).unwrap();

        // 48-byte chunk request; the 64-byte head is within slack
        let b = h.allocate(30, Owner::KERNEL).unwrap();
        assert_eq!(b, a);
        assert_eq!(h.usable_size(b).unwrap(), 64 - CHUNK_OVERHEAD);
    }

    #[test]
    fn test_recent_scan_evicts_misses_to_dirty() {
        let mut h = heap(8192);
        let small = h.allocate(16, Owner::KERNEL).unwrap(); // 32
        let _sep1 = h.allocate(500, Owner::KERNEL).unwrap();
        let mid = h.allocate(100, Owner::KERNEL).unwrap(); // 128
        let _sep2 = h.allocate(600, Owner::KERNEL).unwrap();
        let big = h.allocate(300, Owner::KERNEL).unwrap(); // 320
        let _sep3 = h.allocate(700, Owner::KERNEL).unwrap();

        h.free(Some(small)).unwrap();
        h.free(Some(mid)).unwrap();
        h.free(Some(big)).unwrap(); // recent: big, mid, small

        let again = h.allocate(16, Owner::KERNEL).unwrap();
        assert_eq!(again, small);
        assert!(h.bins.is_empty(ListId::RECENT));
        assert_eq!(
            h.bins.head(ListId::dirty(bin_index(128))),
            Some(Chunk::at(offset_of(&h, mid)))
        );
        assert_eq!(
            h.bins.head(ListId::dirty(bin_index(320))),
            Some(Chunk::at(offset_of(&h, big)))
        );

        // step 2 now finds the evicted chunk in its dirty bin
        let mid_again = h.allocate(100, Owner::KERNEL).unwrap();
        assert_eq!(mid_again, mid);
    }

    #[test]
    fn test_tiny_tail_is_not_split() {
        let mut h = heap(256);
        let p = h.allocate(210, Owner::KERNEL).unwrap(); // wants 240 of 256
        assert_eq!(h.usable_size(p).unwrap(), 256 - CHUNK_OVERHEAD);
        assert!(h.bins.is_empty(ListId::REMAINDER));
        assert_eq!(h.stats().in_use, 256);
    }

    #[test]
    fn test_presplit_on_repeated_size() {
        let mut h = heap(16 * 1024);
        h.allocate(48, Owner::KERNEL).unwrap();
        assert!(h.bins.is_empty(ListId::RECENT));

        h.allocate(48, Owner::KERNEL).unwrap();
        assert_eq!(h.bins.len(&h.arena, ListId::RECENT), PRESPLIT_COUNT);
        for c in h.bins.iter(&h.arena, ListId::RECENT) {
            assert_eq!(h.size_of(c).unwrap(), 64);
        }

        // the next request of that size comes off the recent cache
        let before = h.bins.head(ListId::REMAINDER);
        let next = h.allocate(48, Owner::KERNEL).unwrap();
        assert_eq!(h.bins.head(ListId::REMAINDER), before);
        assert_eq!(offset_of(&h, next), 2 * 64 + (PRESPLIT_COUNT - 1) * 64);
    }

    #[test]
    fn test_coalesce_both_neighbors() {
        let mut h = heap(4096);
        let a = h.allocate(100, Owner::KERNEL).unwrap();
        let b = h.allocate(200, Owner::KERNEL).unwrap();
        let c = h.allocate(300, Owner::KERNEL).unwrap();
        let _d = h.allocate(400, Owner::KERNEL).unwrap();

        h.free(Some(a)).unwrap();
        h.free(Some(c)).unwrap();
        h.free(Some(b)).unwrap();
        h.coalesce_all().unwrap();

        // a + b + c now form one clean chunk at offset 0
        let merged = 128 + 224 + 320;
        let list = ListId::clean(bin_index(merged));
        assert_eq!(h.bins.head(list), Some(Chunk::at(0)));
        assert_eq!(h.size_of(Chunk::at(0)).unwrap(), merged);
        assert_eq!(h.stats().free_chunks, 2);
    }

    #[test]
    fn test_coalesce_merges_into_remainder() {
        let mut h = heap(4096);
        let a = h.allocate(100, Owner::KERNEL).unwrap();
        let b = h.allocate(100, Owner::KERNEL).unwrap();
        h.free(Some(b)).unwrap();
        h.coalesce_all().unwrap();

        // b and the remainder behind it merge; the remainder slot empties
        assert!(h.bins.is_empty(ListId::REMAINDER));
        assert_eq!(h.stats().free_chunks, 1);
        assert_eq!(h.stats().largest_free, 4096 - 128);

        h.free(Some(a)).unwrap();
        h.coalesce_all().unwrap();
        assert_eq!(h.stats().largest_free, 4096);
    }

    #[test]
    fn test_coalesce_with_free_predecessor_only() {
        let mut h = heap(4096);
        let a = h.allocate(100, Owner::KERNEL).unwrap(); // 128 at 0
        let b = h.allocate(200, Owner::KERNEL).unwrap(); // 224 at 128
        let c = h.allocate(300, Owner::KERNEL).unwrap(); // 320 at 352
        let _d = h.allocate(400, Owner::KERNEL).unwrap();

        h.free(Some(a)).unwrap();
        h.coalesce_all().unwrap();
        h.free(Some(b)).unwrap();
        h.coalesce_all().unwrap();

        // b folds back into a; c stays live
        let merged = 128 + 224;
        assert_eq!(offset_of(&h, c), merged);
        assert_eq!(h.bins.head(ListId::clean(bin_index(merged))), Some(Chunk::at(0)));
        assert_eq!(h.size_of(Chunk::at(0)).unwrap(), merged);
        assert_eq!(h.usable_size(c).unwrap(), 320 - CHUNK_OVERHEAD);
        h.check_invariants().unwrap();
    }

    #[test]
    fn test_walks_stop_at_damaged_tag() {
        let mut h = heap(4096);
        h.allocate(100, Owner(3)).unwrap(); // 128 at 0
        let b = h.allocate(100, Owner(3)).unwrap(); // 128 at 128
        h.allocate(100, Owner(3)).unwrap();

        // clobber b's header; the walk can no longer step past it
        let header = (b.as_ptr() as usize - TAG_BYTES) as *mut u64;
        unsafe { header.write(0xDEAD_BEEF) };

        assert_eq!(h.owned_by(Owner(3)), 128);
        let stats = h.stats();
        assert_eq!(stats.free_chunks, 0);
        assert_eq!(stats.in_use, 3 * 128);
        assert!(matches!(
            h.check_invariants(),
            Err(HeapError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_search_coalesces_on_demand() {
        let mut h = heap(4096);
        let ptrs: Vec<_> = (0..8)
            .map(|_| h.allocate(496, Owner::KERNEL).unwrap())
            .collect();
        assert!(h.allocate(16, Owner::KERNEL).is_err());

        for p in ptrs {
            h.free(Some(p)).unwrap();
        }
        let whole = h.allocate(4096 - CHUNK_OVERHEAD, Owner::KERNEL).unwrap();
        assert_eq!(offset_of(&h, whole), 0);
    }

    #[test]
    fn test_owner_stamp() {
        let mut h = heap(4096);
        h.allocate(100, Owner(3)).unwrap();
        h.allocate(10, Owner(3)).unwrap();
        h.allocate(10, Owner(4)).unwrap();

        assert_eq!(h.owned_by(Owner(3)), 128 + 32);
        assert_eq!(h.owned_by(Owner(4)), 32);
        assert_eq!(h.owned_by(Owner(5)), 0);
    }

    #[test]
    fn test_invalid_free_reasons() {
        let mut h = heap(4096);
        let p = h.allocate(64, Owner::KERNEL).unwrap();
        let addr = p.as_ptr() as usize;

        let at = |a: usize| NonNull::new(a as *mut u8);
        let reason = |r: Result<()>| match r {
            Err(HeapError::InvalidFree { reason, .. }) => Some(reason),
            _ => None,
        };

        assert_eq!(reason(h.free(at(addr + 1))), Some(InvalidFreeReason::Misaligned));
        assert_eq!(reason(h.free(at(addr + 8))), Some(InvalidFreeReason::Misaligned));
        assert_eq!(reason(h.free(at(addr + 16))), Some(InvalidFreeReason::NotAllocated));
        assert_eq!(
            reason(h.free(at(h.base_addr() + 8 * 4096))),
            Some(InvalidFreeReason::OutOfRegion)
        );
        assert_eq!(
            reason(h.free(at(h.base_addr()))),
            Some(InvalidFreeReason::OutOfRegion)
        );

        h.free(Some(p)).unwrap();
        assert_eq!(reason(h.free(Some(p))), Some(InvalidFreeReason::NotAllocated));
        assert_eq!(h.stats().frees, 1);
    }

    #[test]
    fn test_free_none_is_noop() {
        let mut h = heap(4096);
        h.free(None).unwrap();
        assert_eq!(h.stats().frees, 0);
    }

    #[test]
    fn test_corrupt_header_detected_on_free() {
        let mut h = heap(4096);
        let p = h.allocate(64, Owner::KERNEL).unwrap();
        let off = offset_of(&h, p);
        h.arena.write_u64(off, 0xDEAD_BEEF);

        assert!(matches!(
            h.free(Some(p)),
            Err(HeapError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_stats_track_usage() {
        let mut h = heap(4096);
        let a = h.allocate(100, Owner::KERNEL).unwrap();
        let b = h.allocate(100, Owner::KERNEL).unwrap();
        h.free(Some(a)).unwrap();

        let s = h.stats();
        assert_eq!(s.in_use, 128);
        assert_eq!(s.high_water, 256);
        assert_eq!(s.allocations, 2);
        assert_eq!(s.frees, 1);
        assert_eq!(s.in_use + s.free_bytes, s.region_bytes);
        h.free(Some(b)).unwrap();
    }
}
