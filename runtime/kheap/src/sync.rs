//! Locking collaborators for the kernel heap
//!
//! The heap itself only needs a lock with acquire/try/release and a way to
//! mask interrupts around its critical section. Both are traits so the
//! kernel can plug in its own primitives; this module ships spin-based and
//! no-op defaults that the hosted tests use.

/// Minimal lock interface the heap is written against
pub trait RawLock {
    /// Block until the lock is held.
    fn acquire(&self);

    /// Take the lock if it is free.
    fn try_acquire(&self) -> bool;

    /// Release a lock held by this context.
    ///
    /// Callers must pair it with a successful `acquire`/`try_acquire`.
    fn release(&self);
}

/// Spinlock over `spin::Mutex`, the kernel's lock crate
pub struct SpinLock {
    inner: spin::Mutex<()>,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for SpinLock {
    fn acquire(&self) {
        // Held until `release`; the guard is not tied to a scope here.
        core::mem::forget(self.inner.lock());
    }

    fn try_acquire(&self) -> bool {
        match self.inner.try_lock() {
            Some(guard) => {
                core::mem::forget(guard);
                true
            }
            None => false,
        }
    }

    fn release(&self) {
        // SAFETY: RawLock callers only release a lock they acquired, and
        // the matching guard was forgotten in acquire/try_acquire.
        unsafe { self.inner.force_unlock() }
    }
}

/// Interrupt masking around the heap's critical section
pub trait InterruptControl {
    /// Whatever `restore` needs to put the mask back
    type State: Copy;

    /// Mask interrupts and return the previous state.
    fn disable(&self) -> Self::State;

    fn restore(&self, state: Self::State);
}

/// No interrupts to mask (hosted builds, single-context kernels)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    type State = ();

    fn disable(&self) {}

    fn restore(&self, _state: ()) {}
}

/// IRQ masking through DAIF on bare-metal AArch64
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct DaifIrq;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl InterruptControl for DaifIrq {
    type State = u64;

    #[inline(always)]
    fn disable(&self) -> u64 {
        let daif: u64;
        // SAFETY: reading DAIF and setting the I bit is always allowed at EL1.
        unsafe {
            core::arch::asm!(
                "mrs {daif}, daif",
                "msr daifset, #2",
                daif = out(reg) daif,
                options(nostack),
            );
        }
        daif
    }

    #[inline(always)]
    fn restore(&self, state: u64) {
        // SAFETY: writes back a value previously read from DAIF.
        unsafe {
            core::arch::asm!(
                "msr daif, {daif}",
                daif = in(reg) state,
                options(nostack),
            );
        }
    }
}

/// Which kernel context is calling into the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallContext {
    /// Ordinary task context; may spin on the lock
    Task,
    /// Exception or interrupt context; never waits for the lock
    Privileged,
}

/// Holds the heap lock and the interrupt mask until dropped
///
/// Both paths mask interrupts for the whole critical section. On a single
/// core this keeps a handler from ever finding the lock held by the task
/// it interrupted; if it does (another core, or a handler nested inside the
/// heap), the privileged path gives up instead of spinning with interrupts
/// masked.
pub(crate) struct HeapGuard<'l, L: RawLock, I: InterruptControl> {
    lock: &'l L,
    irq: &'l I,
    saved: I::State,
}

impl<'l, L: RawLock, I: InterruptControl> HeapGuard<'l, L, I> {
    /// Task path: mask, then spin until the lock is ours.
    pub fn task(lock: &'l L, irq: &'l I) -> Self {
        let saved = irq.disable();
        lock.acquire();
        Self { lock, irq, saved }
    }

    /// Privileged path: mask and try the lock once.
    pub fn privileged(lock: &'l L, irq: &'l I) -> Option<Self> {
        let saved = irq.disable();
        if lock.try_acquire() {
            Some(Self { lock, irq, saved })
        } else {
            irq.restore(saved);
            None
        }
    }

    pub fn acquire(lock: &'l L, irq: &'l I, context: CallContext) -> Option<Self> {
        match context {
            CallContext::Task => Some(Self::task(lock, irq)),
            CallContext::Privileged => Self::privileged(lock, irq),
        }
    }
}

impl<L: RawLock, I: InterruptControl> Drop for HeapGuard<'_, L, I> {
    fn drop(&mut self) {
        self.lock.release();
        self.irq.restore(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct CountingIrq {
        masked: Cell<bool>,
        disables: Cell<u32>,
    }

    impl InterruptControl for CountingIrq {
        type State = bool;

        fn disable(&self) -> bool {
            self.disables.set(self.disables.get() + 1);
            self.masked.replace(true)
        }

        fn restore(&self, state: bool) {
            self.masked.set(state);
        }
    }

    #[test]
    fn test_spinlock_acquire_release() {
        let lock = SpinLock::new();
        lock.acquire();
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());

        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_task_guard_masks_and_restores() {
        let lock = SpinLock::new();
        let irq = CountingIrq::default();
        {
            let _guard = HeapGuard::task(&lock, &irq);
            assert!(lock.is_locked());
            assert!(irq.masked.get());
        }
        assert!(!lock.is_locked());
        assert!(!irq.masked.get());
        assert_eq!(irq.disables.get(), 1);
    }

    #[test]
    fn test_privileged_guard_masks_and_restores() {
        let lock = SpinLock::new();
        let irq = CountingIrq::default();
        {
            let guard = HeapGuard::acquire(&lock, &irq, CallContext::Privileged);
            assert!(guard.is_some());
            assert!(lock.is_locked());
            assert!(irq.masked.get());
        }
        assert!(!lock.is_locked());
        assert!(!irq.masked.get());
    }

    #[test]
    fn test_privileged_guard_gives_up_on_held_lock() {
        let lock = SpinLock::new();
        let irq = CountingIrq::default();
        lock.acquire();

        assert!(HeapGuard::privileged(&lock, &irq).is_none());
        // mask is back to what it was, lock still belongs to the holder
        assert!(!irq.masked.get());
        assert!(lock.is_locked());
        lock.release();
    }

    #[test]
    fn test_nested_mask_is_preserved() {
        let lock = SpinLock::new();
        let irq = CountingIrq::default();
        irq.masked.set(true);
        {
            let _guard = HeapGuard::task(&lock, &irq);
        }
        assert!(irq.masked.get());
    }
}
