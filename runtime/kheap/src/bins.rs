//! Bin table and free-list management
//!
//! Each bin has two lists, `clean` (maximal free chunks) and `dirty` (freed
//! chunks not yet checked for free neighbours). Both are ascending by
//! address. Bin 0 is not a size class: its dirty list is the LIFO recent
//! cache and its clean list is the remainder cache (zero or one chunk).
//!
//! Lists are threaded through the free chunks themselves. `next` holds the
//! following chunk's offset; `prev` holds an encoded [`Slot`] naming the
//! field that points at this chunk, which is either a list head in the
//! table or the `next` field of the preceding chunk. Unlinking rewrites that
//! slot directly without walking the list.

use crate::arena::Arena;
use crate::chunk::{self, Chunk, NIL, UNLINKED};
use crate::config::{BIN_COUNT, FAST_BIN_LIMIT, GRANULE, MAX_RANGE_BIN};
use crate::error::{HeapError, Result};

const FAST_BINS: usize = FAST_BIN_LIMIT / GRANULE;
const RANGE_BINS: usize = BIN_COUNT - 1 - FAST_BINS;
const HEAD_FLAG: u32 = 1 << 31;

/// Size class of a chunk size. Never returns 0.
pub(crate) fn bin_index(size: usize) -> usize {
    if size < FAST_BIN_LIMIT {
        (size / GRANULE).max(1)
    } else if size < MAX_RANGE_BIN {
        FAST_BINS + (size - FAST_BIN_LIMIT) * RANGE_BINS / (MAX_RANGE_BIN - FAST_BIN_LIMIT)
    } else {
        BIN_COUNT - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    Clean,
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListId {
    bin: u8,
    kind: ListKind,
}

impl ListId {
    pub const RECENT: ListId = ListId {
        bin: 0,
        kind: ListKind::Dirty,
    };

    pub const REMAINDER: ListId = ListId {
        bin: 0,
        kind: ListKind::Clean,
    };

    pub fn clean(bin: usize) -> Self {
        debug_assert!(bin > 0 && bin < BIN_COUNT);
        ListId {
            bin: bin as u8,
            kind: ListKind::Clean,
        }
    }

    pub fn dirty(bin: usize) -> Self {
        debug_assert!(bin > 0 && bin < BIN_COUNT);
        ListId {
            bin: bin as u8,
            kind: ListKind::Dirty,
        }
    }

    pub fn bin(self) -> usize {
        self.bin as usize
    }

    pub fn kind(self) -> ListKind {
        self.kind
    }
}

/// Where a chunk should be filed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinMode {
    Dirty,
    Clean,
    Recent,
    Remainder,
}

/// The field that references a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Head(ListId),
    Next(Chunk),
}

impl Slot {
    fn encode(self) -> u32 {
        match self {
            Slot::Head(list) => {
                let kind = match list.kind {
                    ListKind::Clean => 0,
                    ListKind::Dirty => 1,
                };
                HEAD_FLAG | (list.bin as u32) << 1 | kind
            }
            Slot::Next(chunk) => chunk.link(),
        }
    }

    fn decode(raw: u32) -> Option<Slot> {
        if raw == UNLINKED {
            return None;
        }
        if raw & HEAD_FLAG == 0 {
            return Some(Slot::Next(Chunk::at(raw as usize)));
        }
        let bin = ((raw & !HEAD_FLAG) >> 1) as usize;
        if bin >= BIN_COUNT {
            return None;
        }
        let kind = if raw & 1 == 0 {
            ListKind::Clean
        } else {
            ListKind::Dirty
        };
        Some(Slot::Head(ListId {
            bin: bin as u8,
            kind,
        }))
    }
}

/// Heads of every list, `[clean, dirty]` per bin
pub(crate) struct BinTable {
    heads: [[u32; 2]; BIN_COUNT],
}

impl BinTable {
    pub const fn new() -> Self {
        Self {
            heads: [[NIL; 2]; BIN_COUNT],
        }
    }

    fn head_ref(&mut self, list: ListId) -> &mut u32 {
        let idx = match list.kind {
            ListKind::Clean => 0,
            ListKind::Dirty => 1,
        };
        &mut self.heads[list.bin()][idx]
    }

    pub fn head(&self, list: ListId) -> Option<Chunk> {
        let idx = match list.kind {
            ListKind::Clean => 0,
            ListKind::Dirty => 1,
        };
        Chunk::from_link(self.heads[list.bin()][idx])
    }

    pub fn is_empty(&self, list: ListId) -> bool {
        self.head(list).is_none()
    }

    /// Next chunk on the same list
    pub fn next(&self, arena: &Arena<'_>, chunk: Chunk) -> Option<Chunk> {
        Chunk::from_link(chunk::next_link(arena, chunk))
    }

    pub fn iter<'t>(&'t self, arena: &'t Arena<'t>, list: ListId) -> ListIter<'t> {
        ListIter {
            arena,
            cur: self.head(list),
            budget: arena.len() / crate::config::MIN_ALLOC_BYTES,
        }
    }

    pub fn len(&self, arena: &Arena<'_>, list: ListId) -> usize {
        self.iter(arena, list).count()
    }

    /// Decode the back-reference stored in a chunk
    pub fn slot_of(&self, arena: &Arena<'_>, chunk: Chunk) -> Option<Slot> {
        Slot::decode(chunk::prev_link(arena, chunk))
    }

    fn read_slot(&self, arena: &Arena<'_>, slot: Slot) -> u32 {
        match slot {
            Slot::Head(list) => {
                let idx = match list.kind {
                    ListKind::Clean => 0,
                    ListKind::Dirty => 1,
                };
                self.heads[list.bin()][idx]
            }
            Slot::Next(owner) => chunk::next_link(arena, owner),
        }
    }

    fn write_slot(&mut self, arena: &mut Arena<'_>, slot: Slot, link: u32) {
        match slot {
            Slot::Head(list) => *self.head_ref(list) = link,
            Slot::Next(owner) => chunk::set_next_link(arena, owner, link),
        }
    }

    fn insert_at(&mut self, arena: &mut Arena<'_>, slot: Slot, chunk: Chunk) {
        let old = self.read_slot(arena, slot);
        chunk::set_next_link(arena, chunk, old);
        chunk::set_prev_link(arena, chunk, slot.encode());
        self.write_slot(arena, slot, chunk.link());
        if let Some(following) = Chunk::from_link(old) {
            chunk::set_prev_link(arena, following, Slot::Next(chunk).encode());
        }
    }

    /// Insert keeping the list ascending by address
    fn insert_ordered(&mut self, arena: &mut Arena<'_>, list: ListId, chunk: Chunk) {
        let mut slot = Slot::Head(list);
        let mut cur = self.head(list);
        while let Some(c) = cur {
            if c > chunk {
                break;
            }
            slot = Slot::Next(c);
            cur = self.next(arena, c);
        }
        self.insert_at(arena, slot, chunk);
    }

    /// File an unlinked free chunk of `size` bytes.
    pub fn bin_chunk(&mut self, arena: &mut Arena<'_>, chunk: Chunk, size: usize, mode: BinMode) {
        contract!(
            chunk::prev_link(arena, chunk) == UNLINKED,
            "bin_chunk: chunk {:#x} is still linked",
            chunk.offset()
        );

        match mode {
            BinMode::Dirty => self.insert_ordered(arena, ListId::dirty(bin_index(size)), chunk),
            BinMode::Clean => self.insert_ordered(arena, ListId::clean(bin_index(size)), chunk),
            BinMode::Recent => self.insert_at(arena, Slot::Head(ListId::RECENT), chunk),
            BinMode::Remainder => {
                contract!(
                    self.is_empty(ListId::REMAINDER),
                    "bin_chunk: remainder cache already occupied"
                );
                self.insert_at(arena, Slot::Head(ListId::REMAINDER), chunk)
            }
        }
    }

    /// Remove a chunk from whichever list holds it.
    pub fn unlink_chunk(&mut self, arena: &mut Arena<'_>, chunk: Chunk) -> Result<()> {
        let slot = self
            .slot_of(arena, chunk)
            .ok_or(HeapError::corrupt(chunk.offset(), "free chunk not on any list"))?;
        if self.read_slot(arena, slot) != chunk.link() {
            return Err(HeapError::corrupt(chunk.offset(), "back-reference does not point here"));
        }

        let next = chunk::next_link(arena, chunk);
        self.write_slot(arena, slot, next);
        if let Some(following) = Chunk::from_link(next) {
            chunk::set_prev_link(arena, following, slot.encode());
        }
        chunk::clear_links(arena, chunk);
        Ok(())
    }

    /// Remove and return the first chunk of a list
    pub fn pop(&mut self, arena: &mut Arena<'_>, list: ListId) -> Result<Option<Chunk>> {
        match self.head(list) {
            Some(c) => {
                self.unlink_chunk(arena, c)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    /// Every list in the table, bin 0 first
    pub fn lists() -> impl Iterator<Item = ListId> {
        [ListId::RECENT, ListId::REMAINDER]
            .into_iter()
            .chain((1..BIN_COUNT).flat_map(|b| [ListId::clean(b), ListId::dirty(b)]))
    }
}

/// Walks one list; stops early if the list is longer than the region could
/// possibly hold, which only happens on a corrupted cycle.
pub(crate) struct ListIter<'t> {
    arena: &'t Arena<'t>,
    cur: Option<Chunk>,
    budget: usize,
}

impl Iterator for ListIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let c = self.cur?;
        if self.budget == 0 {
            self.cur = None;
            return None;
        }
        self.budget -= 1;
        self.cur = Chunk::from_link(chunk::next_link(self.arena, c));
        Some(c)
    }
}
