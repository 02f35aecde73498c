//! Busy-wait lock used for every short critical section in the driver core.
//!
//! Waiters poll with plain loads and only retry the compare-exchange once the
//! word reads free, so a contended lock keeps its cache line shared.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use super::loom_compat::{AtomicBool, Ordering, spin_hint};

/// Busy-wait mutual exclusion around a `T`.
///
/// Const-constructible, so registries and counters can live in `static`s.
/// Guards the device lock, klists and the binding counters; never hold one
/// across a call that may sleep.
pub struct SpinLock<T> {
    held: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through a guard, and at most one guard
// exists at a time; moving `T` between threads needs `T: Send`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `value` in an unheld, anonymous lock.
    #[cfg(not(loom))]
    pub const fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Wraps `value` in an unheld lock reported as `name` in debug output.
    #[cfg(not(loom))]
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Wraps `value` in an unheld, anonymous lock.
    #[cfg(loom)]
    pub fn new(value: T) -> Self {
        Self::named("<unnamed>", value)
    }

    /// Wraps `value` in an unheld lock reported as `name` in debug output.
    #[cfg(loom)]
    pub fn named(name: &'static str, value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(value),
        }
    }

    fn try_acquire(&self, weak: bool) -> bool {
        let swapped = if weak {
            self.held
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        } else {
            self.held
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        };
        swapped.is_ok()
    }

    /// Spins until the lock is ours.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while !self.try_acquire(true) {
            while self.held.load(Ordering::Relaxed) {
                spin_hint();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Takes the lock only if nobody holds it right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.try_acquire(false).then(|| SpinLockGuard { lock: self })
    }

    /// Reports whether some guard is alive. Racy; for assertions only.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Name given to [`named`](Self::named).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Borrows the value without locking; `&mut self` already rules out guards.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Unwraps the value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Held [`SpinLock`]; unlocks on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard came from, so [`Condvar::wait`](super::Condvar::wait)
    /// can take it again after sleeping.
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `held` is set for as long as this guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for `deref`, and `&mut self` makes the borrow unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;

    #[test]
    fn mutual_exclusion() {
        loom::model(|| {
            let lock = Arc::new(SpinLock::new(0usize));
            let other = Arc::clone(&lock);
            let t = loom::thread::spawn(move || {
                *other.lock() += 1;
            });
            *lock.lock() += 1;
            t.join().unwrap();
            assert_eq!(*lock.lock(), 2);
        });
    }
}
