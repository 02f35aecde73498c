//! Interrupt-safe spin lock.
//!
//! Masks interrupts before acquiring the inner spinlock and restores the
//! previous interrupt state on release. This prevents deadlocks when a lock
//! is shared between interrupt handlers and normal kernel code.
//!
//! The masking itself is platform code, so it is installed at runtime through
//! [`set_irq_ops`]. Until then (and always on the host) masking is a no-op.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicPtr;

use super::loom_compat::Ordering;
use super::{SpinLock, SpinLockGuard};

// ---------------------------------------------------------------------------
// Platform hooks
// ---------------------------------------------------------------------------

/// Interrupt masking operations provided by the platform.
#[derive(Debug, Clone, Copy)]
pub struct IrqOps {
    /// Saves the current interrupt state and masks interrupts.
    pub save_and_disable: fn() -> usize,
    /// Restores a state previously returned by `save_and_disable`.
    pub restore: fn(usize),
}

fn host_save() -> usize {
    0
}

fn host_restore(_flags: usize) {}

static HOST_OPS: IrqOps = IrqOps {
    save_and_disable: host_save,
    restore: host_restore,
};

static IRQ_OPS: AtomicPtr<IrqOps> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the platform's interrupt masking operations.
///
/// May be called more than once; locks acquired afterwards use the new hooks.
/// A guard always restores through the hooks it saved with.
pub fn set_irq_ops(ops: &'static IrqOps) {
    IRQ_OPS.store(core::ptr::from_ref(ops).cast_mut(), Ordering::Release);
}

fn irq_ops() -> &'static IrqOps {
    let ptr = IRQ_OPS.load(Ordering::Acquire);
    if ptr.is_null() {
        &HOST_OPS
    } else {
        // SAFETY: Only `&'static IrqOps` references are ever stored.
        unsafe { &*ptr }
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// A spin lock that masks interrupts while held.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Creates a new unlocked `IrqSpinLock` with a name for diagnostics.
    #[cfg(not(loom))]
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            inner: SpinLock::named(name, value),
        }
    }

    /// Creates a new unlocked `IrqSpinLock`.
    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Creates a new unlocked `IrqSpinLock` with a name for diagnostics.
    #[cfg(loom)]
    pub fn named(name: &'static str, value: T) -> Self {
        Self {
            inner: SpinLock::named(name, value),
        }
    }

    /// Acquires the lock, masking interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let ops = irq_ops();
        let saved_flags = (ops.save_and_disable)();
        IrqSpinLockGuard {
            guard: Some(self.inner.lock()),
            ops,
            saved_flags,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let ops = irq_ops();
        let saved_flags = (ops.save_and_disable)();
        if let Some(guard) = self.inner.try_lock() {
            Some(IrqSpinLockGuard {
                guard: Some(guard),
                ops,
                saved_flags,
                _not_send: PhantomData,
            })
        } else {
            // Failed, restore flags.
            (ops.restore)(saved_flags);
            None
        }
    }

    /// Returns `true` if the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Returns a mutable reference to the data; the borrow proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for IrqSpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqSpinLock")
            .field("name", &self.inner.name())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard that restores interrupt state on drop.
///
/// Not `Send`: the saved interrupt state belongs to the CPU that took it.
pub struct IrqSpinLockGuard<'a, T> {
    guard: Option<SpinLockGuard<'a, T>>,
    ops: &'static IrqOps,
    saved_flags: usize,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // The inner guard is only taken in `drop`.
        self.guard.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before unmasking.
        self.guard = None;
        (self.ops.restore)(self.saved_flags);
    }
}
