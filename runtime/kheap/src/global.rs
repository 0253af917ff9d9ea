//! Kernel-wide heap handle
//!
//! One [`KernelHeap`] per kernel, set up once by [`init`] during boot and
//! reached afterwards through the free functions here. Calls made before
//! `init` fail the same way an exhausted heap does.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{null_mut, NonNull};

use crate::config::{ALIGN, HEAP_BASE, HEAP_SIZE};
use crate::error::{HeapError, InvalidFreeReason, Result};
use crate::heap::{Heap, HeapStats};
use crate::kernel_heap::KernelHeap;
use crate::tag::Owner;

static KERNEL_HEAP: spin::Once<KernelHeap<'static>> = spin::Once::new();

/// Build the kernel heap over `region`.
///
/// # Errors
/// `AlreadyInitialized` on a second call, or the region errors from
/// [`Heap::new`].
pub fn init(
    region: &'static mut [u8],
    current_task: fn() -> Owner,
) -> Result<&'static KernelHeap<'static>> {
    if KERNEL_HEAP.is_completed() {
        return Err(HeapError::AlreadyInitialized);
    }
    let heap = Heap::new(region)?;

    let mut installed = false;
    let handle = KERNEL_HEAP.call_once(|| {
        installed = true;
        KernelHeap::with_spinlock(heap).with_task_identity(current_task)
    });
    if !installed {
        return Err(HeapError::AlreadyInitialized);
    }

    log::info!(
        "[kheap] kernel heap ready: {}KB",
        handle.stats().region_bytes / 1024
    );
    Ok(handle)
}

/// Build the kernel heap over the board's fixed heap window.
///
/// # Safety
/// `HEAP_BASE..HEAP_BASE + HEAP_SIZE` must be mapped RAM that nothing else
/// uses for the rest of the kernel's lifetime.
pub unsafe fn init_board_region(current_task: fn() -> Owner) -> Result<&'static KernelHeap<'static>> {
    let region = core::slice::from_raw_parts_mut(HEAP_BASE as *mut u8, HEAP_SIZE);
    init(region, current_task)
}

/// The kernel heap, if `init` has run
pub fn kernel_heap() -> Option<&'static KernelHeap<'static>> {
    KERNEL_HEAP.get()
}

pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    kernel_heap()?.kmalloc(size)
}

pub fn syskmalloc(size: usize) -> Option<NonNull<u8>> {
    kernel_heap()?.syskmalloc(size)
}

pub fn kfree(ptr: Option<NonNull<u8>>) -> Result<()> {
    match kernel_heap() {
        Some(heap) => heap.kfree(ptr),
        None => uninitialized_free(ptr),
    }
}

pub fn syskfree(ptr: Option<NonNull<u8>>) -> Result<()> {
    match kernel_heap() {
        Some(heap) => heap.syskfree(ptr),
        None => uninitialized_free(ptr),
    }
}

fn uninitialized_free(ptr: Option<NonNull<u8>>) -> Result<()> {
    match ptr {
        None => Ok(()),
        Some(p) => Err(HeapError::InvalidFree {
            addr: p.as_ptr() as usize,
            reason: InvalidFreeReason::OutOfRegion,
        }),
    }
}

/// Dump the kernel heap to `out`; prints a single line before `init`.
pub fn kdump<W: fmt::Write>(out: &mut W) -> fmt::Result {
    match kernel_heap() {
        Some(heap) => heap.dump(out),
        None => writeln!(out, "kheap: not initialized"),
    }
}

pub fn stats() -> Option<HeapStats> {
    kernel_heap().map(KernelHeap::stats)
}

/// `GlobalAlloc` over the kernel heap
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: kaal_kheap::KernelAllocator = kaal_kheap::KernelAllocator;
/// ```
///
/// Layouts aligned beyond 8 bytes are refused with a null pointer.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        kmalloc(layout.size()).map_or(null_mut(), NonNull::as_ptr)
    }

    // kmalloc already zero-fills
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(e) = kfree(NonNull::new(ptr)) {
            log::error!("[kheap] dealloc: {}", e);
        }
    }
}
