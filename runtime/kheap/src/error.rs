//! Kernel heap error types

use core::fmt;
use thiserror::Error;

/// Why a pointer handed to `kfree` was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFreeReason {
    /// Not on the heap's alignment grid
    Misaligned,
    /// Outside the managed region
    OutOfRegion,
    /// Not the start of a live allocation (double free, or never allocated)
    NotAllocated,
}

impl fmt::Display for InvalidFreeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidFreeReason::Misaligned => f.write_str("misaligned pointer"),
            InvalidFreeReason::OutOfRegion => f.write_str("pointer outside heap region"),
            InvalidFreeReason::NotAllocated => f.write_str("not a live allocation"),
        }
    }
}

/// Kernel heap errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("Out of heap memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid free of {addr:#x}: {reason}")]
    InvalidFree {
        addr: usize,
        reason: InvalidFreeReason,
    },

    #[error("Heap corrupted at offset {offset:#x}: {detail}")]
    CorruptState { offset: usize, detail: &'static str },

    #[error("Heap region too small ({size} bytes)")]
    RegionTooSmall { size: usize },

    #[error("Heap region of {size} bytes exceeds bitmap coverage ({max} bytes)")]
    RegionTooLarge { size: usize, max: usize },

    #[error("Kernel heap already initialized")]
    AlreadyInitialized,

    #[error("Kernel heap lock held; privileged caller did not wait")]
    LockContended,
}

impl HeapError {
    /// Faults that the reference design treats as fatal
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::InvalidFree { .. } | HeapError::CorruptState { .. }
        )
    }

    pub(crate) fn corrupt(offset: usize, detail: &'static str) -> Self {
        HeapError::CorruptState { offset, detail }
    }
}

pub type Result<T> = core::result::Result<T, HeapError>;
