//! Raw access to the heap region
//!
//! Everything above this module talks about byte offsets into the region.
//! This is the only place that turns an offset into a memory access, and
//! every access is bounds- and alignment-checked first.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::config::GRANULE;

/// The managed byte region, trimmed to the granule grid
pub(crate) struct Arena<'a> {
    base: NonNull<u8>,
    len: usize,
    _region: PhantomData<&'a mut [u8]>,
}

// SAFETY: the arena is the unique owner of its region for 'a; moving it to
// another thread moves that exclusive access with it.
unsafe impl Send for Arena<'_> {}

impl<'a> Arena<'a> {
    /// Take over a region, dropping leading bytes up to the first granule
    /// boundary and trailing bytes past the last whole granule.
    pub fn new(region: &'a mut [u8]) -> Self {
        let lead = region.as_ptr().align_offset(GRANULE).min(region.len());
        let usable = &mut region[lead..];
        let len = usable.len() / GRANULE * GRANULE;
        let base = NonNull::new(usable.as_mut_ptr()).unwrap_or(NonNull::dangling());

        Self {
            base,
            len,
            _region: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.len
    }

    /// Offset of `addr` from the region base, if it lies inside the region
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        if addr >= self.base_addr() && addr < self.end_addr() {
            Some(addr - self.base_addr())
        } else {
            None
        }
    }

    /// Pointer to the byte at `offset`
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "arena offset {offset:#x} out of range");
        // SAFETY: offset is inside the region, so the result is in bounds
        // and non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0 && offset.checked_add(width).is_some_and(|end| end <= self.len),
            "arena access of {width} bytes at {offset:#x} (len {:#x})",
            self.len
        );
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: in bounds and aligned (base is granule aligned).
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.check(offset, 4);
        // SAFETY: in bounds and aligned; &mut self gives exclusive access.
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        // SAFETY: in bounds and aligned (base is granule aligned).
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().read() }
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.check(offset, 8);
        // SAFETY: in bounds and aligned; &mut self gives exclusive access.
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().write(value) }
    }

    /// Zero `len` bytes starting at `offset`
    pub fn zero(&mut self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "arena zero of {len} bytes at {offset:#x} out of range"
        );
        // SAFETY: the whole range is inside the region.
        unsafe { self.base.as_ptr().add(offset).write_bytes(0, len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_trims_to_granule_grid() {
        let mut backing: Vec<u8> = vec![0xFF; 4096 + 7];
        let arena = Arena::new(&mut backing[3..]);

        assert_eq!(arena.base_addr() % GRANULE, 0);
        assert_eq!(arena.len() % GRANULE, 0);
        assert!(arena.len() >= 4096 - GRANULE);
    }

    #[test]
    fn test_read_write_and_zero() {
        let mut backing: Vec<u8> = vec![0xFF; 256 + GRANULE];
        let mut arena = Arena::new(&mut backing);

        arena.write_u64(16, 0x1122_3344_5566_7788);
        arena.write_u32(24, 0xCAFE_F00D);
        assert_eq!(arena.read_u64(16), 0x1122_3344_5566_7788);
        assert_eq!(arena.read_u32(24), 0xCAFE_F00D);

        arena.zero(16, 16);
        assert_eq!(arena.read_u64(16), 0);
        assert_eq!(arena.read_u32(24), 0);
    }

    #[test]
    fn test_offset_of() {
        let mut backing: Vec<u8> = vec![0; 128 + GRANULE];
        let arena = Arena::new(&mut backing);
        let base = arena.base_addr();

        assert_eq!(arena.offset_of(base), Some(0));
        assert_eq!(arena.offset_of(base + 40), Some(40));
        assert_eq!(arena.offset_of(arena.end_addr()), None);
        assert_eq!(arena.offset_of(base.wrapping_sub(1)), None);
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_read_panics() {
        let mut backing: Vec<u8> = vec![0; 64 + GRANULE];
        let arena = Arena::new(&mut backing);
        arena.read_u64(arena.len());
    }

    #[test]
    #[should_panic]
    fn test_misaligned_write_panics() {
        let mut backing: Vec<u8> = vec![0; 64 + GRANULE];
        let mut arena = Arena::new(&mut backing);
        arena.write_u64(4, 1);
    }
}
