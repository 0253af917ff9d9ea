//! Boundary tags
//!
//! Every chunk carries the same 8-byte tag at its first and last word:
//!
//! ```text
//!  63        48 47        32 31                 4 3  1 0
//! +------------+------------+--------------------+----+-+
//! |   magic    |   owner    |        size        | 0  |F|
//! +------------+------------+--------------------+----+-+
//! ```
//!
//! Sizes are granule multiples, so the low bits of the size word are free
//! for flags. The magic halfword catches wild writes over a tag.

use bitflags::bitflags;

use crate::config::GRANULE;

const TAG_MAGIC: u64 = 0x6B68;
const SIZE_MASK: u32 = !(GRANULE as u32 - 1);

bitflags! {
    /// Flag bits below the granule in the size word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TagFlags: u32 {
        const FREE = 1 << 0;
    }
}

/// Identity of the task that owns a chunk (diagnostic only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(pub u16);

impl Owner {
    /// The kernel itself
    pub const KERNEL: Owner = Owner(0);

    /// Stamped on chunks that were never handed out
    pub const NONE: Owner = Owner(u16::MAX);
}

/// Decoded boundary tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub size: usize,
    pub free: bool,
    pub owner: Owner,
}

impl Tag {
    pub const fn free(size: usize) -> Self {
        Self {
            size,
            free: true,
            owner: Owner::NONE,
        }
    }

    pub const fn allocated(size: usize, owner: Owner) -> Self {
        Self {
            size,
            free: false,
            owner,
        }
    }

    pub fn encode(self) -> u64 {
        let mut flags = TagFlags::empty();
        flags.set(TagFlags::FREE, self.free);
        let word = (self.size as u32 & SIZE_MASK) | flags.bits();
        (TAG_MAGIC << 48) | ((self.owner.0 as u64) << 32) | word as u64
    }

    /// Returns `None` when the magic is wrong or reserved bits are set.
    pub fn decode(raw: u64) -> Option<Self> {
        if raw >> 48 != TAG_MAGIC {
            return None;
        }
        let word = raw as u32;
        let flags = TagFlags::from_bits(word & !SIZE_MASK)?;
        Some(Self {
            size: (word & SIZE_MASK) as usize,
            free: flags.contains(TagFlags::FREE),
            owner: Owner((raw >> 32) as u16),
        })
    }

    /// Header/footer agreement only covers extent and state.
    pub fn same_extent(&self, other: &Tag) -> bool {
        self.size == other.size && self.free == other.free
    }
}
