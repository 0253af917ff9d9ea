//! Chunk handles and lifecycle primitives
//!
//! A chunk is identified by the offset of its header inside the arena. Its
//! size lives in the tags, so every helper that needs it goes through
//! [`read_tag`], which also checks that header and footer agree.

use crate::arena::Arena;
use crate::config::{GRANULE, MIN_ALLOC_BYTES, TAG_BYTES};
use crate::error::{HeapError, Result};
use crate::tag::Tag;

/// Link value meaning "no chunk"
pub(crate) const NIL: u32 = u32::MAX;

/// Back-reference value of a chunk that sits on no list
pub(crate) const UNLINKED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Chunk(u32);

impl Chunk {
    pub fn at(offset: usize) -> Self {
        Chunk(offset as u32)
    }

    pub fn from_link(link: u32) -> Option<Self> {
        (link != NIL).then_some(Chunk(link))
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }

    pub fn link(self) -> u32 {
        self.0
    }

    pub fn payload(self) -> usize {
        self.offset() + TAG_BYTES
    }

    fn next_field(self) -> usize {
        self.payload()
    }

    fn prev_field(self) -> usize {
        self.payload() + 4
    }
}

pub(crate) fn write_tags(arena: &mut Arena<'_>, chunk: Chunk, tag: Tag) {
    let raw = tag.encode();
    arena.write_u64(chunk.offset(), raw);
    arena.write_u64(chunk.offset() + tag.size - TAG_BYTES, raw);
}

/// Header tag, validated against the footer it points at
pub(crate) fn read_tag(arena: &Arena<'_>, chunk: Chunk) -> Result<Tag> {
    let offset = chunk.offset();
    if offset % GRANULE != 0 || offset + MIN_ALLOC_BYTES > arena.len() {
        return Err(HeapError::corrupt(offset, "chunk offset off the grid"));
    }

    let header = Tag::decode(arena.read_u64(offset))
        .ok_or(HeapError::corrupt(offset, "bad header tag"))?;
    if header.size < MIN_ALLOC_BYTES
        || header.size % GRANULE != 0
        || offset + header.size > arena.len()
    {
        return Err(HeapError::corrupt(offset, "header size out of range"));
    }

    let footer = Tag::decode(arena.read_u64(offset + header.size - TAG_BYTES))
        .ok_or(HeapError::corrupt(offset, "bad footer tag"))?;
    if !header.same_extent(&footer) {
        return Err(HeapError::corrupt(offset, "header/footer mismatch"));
    }

    Ok(header)
}

pub(crate) fn next_link(arena: &Arena<'_>, chunk: Chunk) -> u32 {
    arena.read_u32(chunk.next_field())
}

pub(crate) fn set_next_link(arena: &mut Arena<'_>, chunk: Chunk, link: u32) {
    arena.write_u32(chunk.next_field(), link);
}

pub(crate) fn prev_link(arena: &Arena<'_>, chunk: Chunk) -> u32 {
    arena.read_u32(chunk.prev_field())
}

pub(crate) fn set_prev_link(arena: &mut Arena<'_>, chunk: Chunk, link: u32) {
    arena.write_u32(chunk.prev_field(), link);
}

pub(crate) fn clear_links(arena: &mut Arena<'_>, chunk: Chunk) {
    set_next_link(arena, chunk, NIL);
    set_prev_link(arena, chunk, UNLINKED);
}

/// Lay out a free, unlinked chunk of `size` bytes at `offset`.
pub(crate) fn init_chunk(arena: &mut Arena<'_>, offset: usize, size: usize) -> Chunk {
    contract!(
        offset % GRANULE == 0 && size % GRANULE == 0,
        "init_chunk: {offset:#x}+{size:#x} not granule aligned"
    );
    contract!(
        size >= MIN_ALLOC_BYTES,
        "init_chunk: size {size} below minimum"
    );
    contract!(
        offset + size <= arena.len(),
        "init_chunk: {offset:#x}+{size:#x} past end of region"
    );

    let chunk = Chunk::at(offset);
    write_tags(arena, chunk, Tag::free(size));
    clear_links(arena, chunk);
    chunk
}

/// Cut `chunk` into a leading chunk of `size` bytes and the rest.
///
/// Both halves come back free and unlinked.
pub(crate) fn split_chunk(arena: &mut Arena<'_>, chunk: Chunk, size: usize) -> Result<(Chunk, Chunk)> {
    let total = read_tag(arena, chunk)?.size;
    contract!(
        total > size,
        "split_chunk: {size} bytes requested from a {total}-byte chunk"
    );
    contract!(
        size % GRANULE == 0,
        "split_chunk: size {size} not granule aligned"
    );

    let head = init_chunk(arena, chunk.offset(), size);
    let rest = init_chunk(arena, chunk.offset() + size, total - size);

    contract!(
        read_tag(arena, head).is_ok_and(|t| t.size == size),
        "split_chunk: head tags disagree"
    );
    contract!(
        read_tag(arena, rest).is_ok_and(|t| t.size == total - size),
        "split_chunk: rest tags disagree"
    );
    Ok((head, rest))
}

/// Physically following chunk, if the region continues
pub(crate) fn successor(arena: &Arena<'_>, chunk: Chunk, size: usize) -> Option<Chunk> {
    let next = chunk.offset() + size;
    (next < arena.len()).then(|| Chunk::at(next))
}

/// Physically preceding chunk, found through its footer
pub(crate) fn predecessor(arena: &Arena<'_>, chunk: Chunk) -> Result<Option<Chunk>> {
    let offset = chunk.offset();
    if offset == 0 {
        return Ok(None);
    }

    let footer = Tag::decode(arena.read_u64(offset - TAG_BYTES))
        .ok_or(HeapError::corrupt(offset - TAG_BYTES, "bad footer below chunk"))?;
    if footer.size > offset || footer.size < MIN_ALLOC_BYTES {
        return Err(HeapError::corrupt(offset - TAG_BYTES, "footer size out of range"));
    }

    let pred = Chunk::at(offset - footer.size);
    // Header must agree with the footer we came through.
    let header = read_tag(arena, pred)?;
    if header.size != footer.size {
        return Err(HeapError::corrupt(pred.offset(), "predecessor not adjacent"));
    }
    Ok(Some(pred))
}
