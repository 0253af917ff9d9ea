//! Locked kernel heap
//!
//! `KernelHeap` is what the rest of the kernel sees: the `kmalloc` family,
//! each call taking the heap lock through the path that matches its
//! calling context and stamping the current task as owner.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

use crate::config::FaultPolicy;
use crate::error::{HeapError, Result};
use crate::heap::{Heap, HeapStats};
use crate::sync::{CallContext, HeapGuard, InterruptControl, NoInterrupts, RawLock, SpinLock};
use crate::tag::Owner;

fn kernel_owner() -> Owner {
    Owner::KERNEL
}

/// A [`Heap`] behind a lock, with the kernel's allocation API
pub struct KernelHeap<'a, L: RawLock = SpinLock, I: InterruptControl = NoInterrupts> {
    lock: L,
    irq: I,
    heap: UnsafeCell<Heap<'a>>,
    current_task: fn() -> Owner,
    policy: FaultPolicy,
}

// SAFETY: every access to `heap` happens while holding `lock` (see
// `locked` and `with_heap`), so shared references never touch it
// concurrently.
unsafe impl<L: RawLock + Sync, I: InterruptControl + Sync> Sync for KernelHeap<'_, L, I> {}

impl<'a> KernelHeap<'a> {
    /// Wrap `heap` with the default spinlock and no interrupt masking.
    pub fn with_spinlock(heap: Heap<'a>) -> Self {
        Self::new(heap, SpinLock::new(), NoInterrupts)
    }
}

impl<'a, L: RawLock, I: InterruptControl> KernelHeap<'a, L, I> {
    pub fn new(heap: Heap<'a>, lock: L, irq: I) -> Self {
        Self {
            lock,
            irq,
            heap: UnsafeCell::new(heap),
            current_task: kernel_owner,
            policy: FaultPolicy::default(),
        }
    }

    /// Accessor for the running task's id, used to stamp ownership
    pub fn with_task_identity(mut self, current_task: fn() -> Owner) -> Self {
        self.current_task = current_task;
        self
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Run `f` under the task-path lock.
    fn locked<R>(&self, f: impl FnOnce(&mut Heap<'a>) -> R) -> R {
        let _guard = HeapGuard::task(&self.lock, &self.irq);
        // SAFETY: the guard holds the lock for the rest of this scope, so
        // this is the only live reference to the heap.
        let heap = unsafe { &mut *self.heap.get() };
        f(heap)
    }

    /// Run `f` under the lock path of `context`. A privileged caller that
    /// finds the lock held gets `LockContended` instead of waiting.
    fn with_heap<R>(
        &self,
        context: CallContext,
        f: impl FnOnce(&mut Heap<'a>) -> Result<R>,
    ) -> Result<R> {
        let Some(_guard) = HeapGuard::acquire(&self.lock, &self.irq, context) else {
            log::warn!("[kheap] lock contended in privileged context");
            return Err(HeapError::LockContended);
        };
        // SAFETY: as in `locked`.
        let heap = unsafe { &mut *self.heap.get() };
        f(heap)
    }

    fn try_allocate(&self, size: usize, context: CallContext) -> Result<NonNull<u8>> {
        let owner = (self.current_task)();
        self.with_heap(context, |heap| heap.allocate(size, owner))
            .inspect_err(|e| self.fault(e))
    }

    fn free(&self, ptr: Option<NonNull<u8>>, context: CallContext) -> Result<()> {
        self.with_heap(context, |heap| heap.free(ptr))
            .inspect_err(|e| self.fault(e))
    }

    /// Halt on a fatal fault, or log and hand it back under `Report`.
    fn fault(&self, e: &HeapError) {
        if !e.is_fatal() {
            return;
        }
        log::error!("[kheap] {}", e);
        if self.policy == FaultPolicy::Halt {
            panic!("kernel heap fault: {}", e);
        }
    }

    /// Allocate `size` zeroed bytes from task context.
    ///
    /// Returns `None` when the heap is exhausted. Under
    /// [`FaultPolicy::Report`] a corrupted heap also yields `None`; use
    /// [`KernelHeap::try_kmalloc`] to tell the two apart.
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size, CallContext::Task).ok()
    }

    /// `kmalloc` that reports why it failed
    ///
    /// # Errors
    /// `OutOfMemory`, or `CorruptState` under [`FaultPolicy::Report`].
    pub fn try_kmalloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_allocate(size, CallContext::Task)
    }

    /// Free a pointer from `kmalloc`/`syskmalloc`; `None` is ignored.
    pub fn kfree(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        self.free(ptr, CallContext::Task)
    }

    /// `kmalloc` for exception and interrupt handlers
    ///
    /// Never waits: if the lock is held (by the context this handler
    /// interrupted, or another core) the call returns `None`.
    pub fn syskmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size, CallContext::Privileged).ok()
    }

    /// `syskmalloc` that reports why it failed, including `LockContended`
    pub fn try_syskmalloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_allocate(size, CallContext::Privileged)
    }

    /// `kfree` for exception and interrupt handlers
    ///
    /// # Errors
    /// `LockContended` if the lock is held; the pointer stays allocated.
    pub fn syskfree(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        self.free(ptr, CallContext::Privileged)
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.locked(|heap| heap.usable_size(ptr))
    }

    pub fn owned_by(&self, owner: Owner) -> usize {
        self.locked(|heap| heap.owned_by(owner))
    }

    pub fn stats(&self) -> HeapStats {
        self.locked(|heap| heap.stats())
    }

    pub fn coalesce(&self) -> Result<()> {
        self.locked(|heap| heap.coalesce_all())
            .inspect_err(|e| self.fault(e))
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.locked(|heap| heap.check_invariants())
    }

    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.locked(|heap| heap.dump(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidFreeReason;
    use std::boxed::Box;

    fn kernel_heap(bytes: usize) -> KernelHeap<'static> {
        let raw = Box::leak(vec![0u8; bytes + 16].into_boxed_slice());
        let lead = raw.as_ptr().align_offset(16);
        KernelHeap::with_spinlock(Heap::new(&mut raw[lead..lead + bytes]).unwrap())
    }

    #[test]
    fn test_kmalloc_kfree() {
        let kh = kernel_heap(4096);
        let p = kh.kmalloc(100).unwrap();
        assert_eq!(kh.stats().in_use, 128);
        kh.kfree(Some(p)).unwrap();
        assert_eq!(kh.stats().in_use, 0);
        kh.kfree(None).unwrap();
    }

    #[test]
    fn test_lock_released_after_each_call() {
        let kh = kernel_heap(4096);
        let p = kh.syskmalloc(10).unwrap();
        assert!(!kh.lock.is_locked());
        kh.syskfree(Some(p)).unwrap();
        assert!(!kh.lock.is_locked());
    }

    #[test]
    fn test_out_of_memory_is_none() {
        let kh = kernel_heap(4096);
        assert!(kh.kmalloc(1 << 20).is_none());
        assert_eq!(kh.stats().failed, 1);
    }

    #[test]
    fn test_owner_from_task_identity() {
        let kh = kernel_heap(4096).with_task_identity(|| Owner(42));
        kh.kmalloc(64).unwrap();
        assert_eq!(kh.owned_by(Owner(42)), 80);
        assert_eq!(kh.owned_by(Owner::KERNEL), 0);
    }

    #[test]
    fn test_report_policy_returns_invalid_free() {
        let kh = kernel_heap(4096).with_fault_policy(FaultPolicy::Report);
        let p = kh.kmalloc(64).unwrap();
        kh.kfree(Some(p)).unwrap();
        assert_eq!(
            kh.kfree(Some(p)),
            Err(HeapError::InvalidFree {
                addr: p.as_ptr() as usize,
                reason: InvalidFreeReason::NotAllocated,
            })
        );
        // the lock survives the failed call
        assert!(kh.kmalloc(16).is_some());
    }

    #[test]
    fn test_privileged_calls_do_not_wait_for_held_lock() {
        let kh = kernel_heap(4096);
        let p = kh.kmalloc(64).unwrap();

        // a task holds the lock when the handler runs
        kh.lock.acquire();
        assert!(kh.syskmalloc(16).is_none());
        assert_eq!(kh.try_syskmalloc(16), Err(HeapError::LockContended));
        assert_eq!(kh.syskfree(Some(p)), Err(HeapError::LockContended));
        kh.lock.release();

        // nothing changed while the handler was turned away
        assert_eq!(kh.stats().allocations, 1);
        kh.syskfree(Some(p)).unwrap();
        assert!(kh.syskmalloc(16).is_some());
        kh.check_invariants().unwrap();
    }

    #[test]
    fn test_try_kmalloc_separates_exhaustion_from_corruption() {
        let kh = kernel_heap(4096).with_fault_policy(FaultPolicy::Report);
        assert!(matches!(
            kh.try_kmalloc(1 << 20),
            Err(HeapError::OutOfMemory { .. })
        ));

        let p = kh.kmalloc(64).unwrap();
        kh.kfree(Some(p)).unwrap();
        // smash the freed chunk's header; it sits at the head of the recent cache
        let header = (p.as_ptr() as usize - 8) as *mut u64;
        unsafe { header.write(0xDEAD_BEEF) };

        assert!(matches!(
            kh.try_kmalloc(64),
            Err(HeapError::CorruptState { .. })
        ));
        assert!(kh.kmalloc(64).is_none());
    }

    #[test]
    #[should_panic(expected = "kernel heap fault")]
    fn test_halt_policy_panics_on_double_free() {
        let kh = kernel_heap(4096).with_fault_policy(FaultPolicy::Halt);
        let p = kh.kmalloc(64).unwrap();
        kh.kfree(Some(p)).unwrap();
        let _ = kh.kfree(Some(p));
    }
}
