//! Allocation bitmap
//!
//! One bit per granule of the heap region; a bit is set exactly when a live,
//! caller-owned chunk starts at that granule. The allocator never searches
//! it for free space. It exists so `kfree` can reject pointers it never
//! handed out, and so the audit can cross-check the tags.

use crate::config::BITMAP_BYTES;

const WORDS: usize = BITMAP_BYTES / 8;

/// Number of granules the bitmap can describe
pub(crate) const MAX_BITS: usize = WORDS * 64;

pub(crate) struct AllocBitmap {
    words: [u64; WORDS],
}

impl AllocBitmap {
    pub const fn new() -> Self {
        AllocBitmap { words: [0; WORDS] }
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        let word = index / 64;
        let bit = index % 64;
        (self.words[word] & (1u64 << bit)) != 0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        let bit = index % 64;
        self.words[word] |= 1u64 << bit;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        let word = index / 64;
        let bit = index % 64;
        self.words[word] &= !(1u64 << bit);
    }

    /// Set bits among the first `bits` granules
    pub fn count_set(&self, bits: usize) -> usize {
        let full = bits / 64;
        let mut count: usize = self.words[..full]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();
        let tail = bits % 64;
        if tail != 0 {
            count += (self.words[full] & ((1u64 << tail) - 1)).count_ones() as usize;
        }
        count
    }

    /// Raw words covering the first `bits` granules, for the dump
    pub fn words(&self, bits: usize) -> &[u64] {
        &self.words[..bits.div_ceil(64)]
    }
}
