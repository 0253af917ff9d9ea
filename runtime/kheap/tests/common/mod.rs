//! Shared helpers for the integration tests

#![allow(dead_code)]

use kaal_kheap::config::GRANULE;

/// Leaked, granule-aligned backing store of exactly `bytes` bytes
pub fn region(bytes: usize) -> &'static mut [u8] {
    let raw = Box::leak(vec![0u8; bytes + GRANULE].into_boxed_slice());
    let lead = raw.as_ptr().align_offset(GRANULE);
    &mut raw[lead..lead + bytes]
}

/// Small deterministic generator for allocate/free sequences
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    /// Uniform-ish value in `0..bound`
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}
