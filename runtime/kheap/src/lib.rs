//! Kernel Heap - Boundary-tag allocator for the KaaL kernel heap region
//!
//! # Purpose
//! Provides `kmalloc`/`kfree` for the kernel and its services (scheduler,
//! device namespace, shell) on a single, statically sized RAM region. There
//! is no virtual memory and nothing below the heap to return memory to.
//!
//! # Integration Points
//! - Depends on: a lock primitive ([`sync::RawLock`]) and a task identity
//!   accessor used to stamp chunk ownership
//! - Provides to: every kernel subsystem that needs dynamic memory
//!
//! # Architecture
//! - Boundary tags at both ends of every chunk (`tag`, `chunk`)
//! - 128 segregated bins with clean and dirty address-ordered lists, plus a
//!   LIFO recent cache and a single-entry remainder cache in bin 0 (`bins`)
//! - Side bitmap marking live chunk starts, used to validate `kfree`
//! - Lazy coalescing: `kfree` only pushes onto the recent cache, merging
//!   happens during the allocation search or an explicit pass
//!
//! # Testing Strategy
//! - Unit tests: tag encoding, list manipulation, search steps, coalescing
//! - Integration tests: overlap/conservation properties over randomized
//!   sequences, convergence scenarios, locking under contention
//! - Benchmarks: burst and mixed-size allocation (`benches/kheap.rs`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

/// Contract check that can be compiled out with `--no-default-features`.
macro_rules! contract {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(feature = "contracts") && !$cond {
            panic!($($arg)+);
        }
    };
}

pub mod config;
pub mod error;
pub mod global;
pub mod sync;
pub mod tag;

mod arena;
mod audit;
mod bins;
mod bitmap;
mod chunk;
mod dump;
mod heap;
mod kernel_heap;

pub use config::FaultPolicy;
pub use error::{HeapError, InvalidFreeReason, Result};
pub use global::KernelAllocator;
pub use heap::{Heap, HeapStats};
pub use kernel_heap::KernelHeap;
pub use sync::{CallContext, InterruptControl, NoInterrupts, RawLock, SpinLock};
pub use tag::Owner;
