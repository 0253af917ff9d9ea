//! Kernel heap configuration
//!
//! Compile-time layout of the heap region and its chunks. The board values
//! (`HEAP_BASE`, `HEAP_SIZE`) describe the SRAM window handed to the heap;
//! the rest is fixed by the chunk layout:
//!
//! ```text
//! offset 0        8            16                      size-8     size
//!        +--------+------------+-----------------------+----------+
//!        | header | next, prev |        payload        |  footer  |
//!        +--------+------------+-----------------------+----------+
//!                 ^ returned pointer (8-byte aligned)
//! ```
//!
//! `next`/`prev` only exist while the chunk is free; an allocated chunk
//! hands those bytes to the caller.

use static_assertions::{const_assert, const_assert_eq};

/// Physical base of the kernel heap window on the reference board
pub const HEAP_BASE: usize = 0x4010_0000;

/// Size of the kernel heap window (1MB)
pub const HEAP_SIZE: usize = 1024 * 1024;

/// Alignment of every pointer returned by the heap (double word)
pub const ALIGN: usize = 8;

/// Chunk offsets and sizes are multiples of the granule
pub const GRANULE: usize = 16;

/// Width of one boundary tag
pub const TAG_BYTES: usize = 8;

/// Header plus footer
pub const CHUNK_OVERHEAD: usize = 2 * TAG_BYTES;

/// Free-list links stored in the payload of a free chunk
pub const LINK_BYTES: usize = 8;

/// Smallest chunk: tags plus links, rounded to the granule
pub const MIN_ALLOC_BYTES: usize = 32;

/// Allocation bitmap size (one bit per granule)
pub const BITMAP_BYTES: usize = 16 * 1024;

/// Largest region the bitmap can cover
pub const MAX_REGION_BYTES: usize = BITMAP_BYTES * 8 * GRANULE;

/// Number of bins; bin 0 holds the recent and remainder caches
pub const BIN_COUNT: usize = 128;

/// Chunk sizes below this map 1:1 onto bins with a granule stride
pub const FAST_BIN_LIMIT: usize = 1024;

/// Chunk sizes at or above this all land in the last bin
pub const MAX_RANGE_BIN: usize = 64 * 1024;

/// Extra same-size chunks carved into the recent cache during a burst
pub const PRESPLIT_COUNT: usize = 4;

// The bitmap must cover the board region; a bad board config fails the build.
const_assert!(BITMAP_BYTES * 8 * GRANULE >= HEAP_SIZE);
const_assert_eq!(BITMAP_BYTES % 8, 0);

const_assert_eq!(GRANULE % ALIGN, 0);
const_assert_eq!(TAG_BYTES % ALIGN, 0);
const_assert_eq!(MIN_ALLOC_BYTES % GRANULE, 0);
const_assert!(MIN_ALLOC_BYTES >= CHUNK_OVERHEAD + LINK_BYTES);
const_assert!(GRANULE.is_power_of_two());

const_assert!(FAST_BIN_LIMIT / GRANULE < BIN_COUNT);
const_assert!(FAST_BIN_LIMIT < MAX_RANGE_BIN);

// Offsets must leave the top bit free for list-head slot encoding.
const_assert!(MAX_REGION_BYTES < (1 << 31));

/// What the kernel heap does with `InvalidFree` and `CorruptState`
///
/// The kernel has no memory protection, so the default halts: continuing
/// after a bad free or a smashed tag only spreads the damage. Hosted builds
/// and tests can switch to `Report` to observe the error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Log the fault and panic
    Halt,
    /// Log the fault and return it to the caller
    Report,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        if cfg!(feature = "halt-on-fault") {
            FaultPolicy::Halt
        } else {
            FaultPolicy::Report
        }
    }
}
