//! Condition variable for blocking waits.
//!
//! [`Condvar`] lets a thread wait until a predicate over [`SpinLock`]-protected
//! state becomes true, releasing and re-acquiring the lock around the wait.
//! Waiters spin on a notification generation counter, so no scheduler is
//! needed; a notification that races with a waiter is never lost because the
//! waiter samples the generation while still holding the lock.

use super::loom_compat::{AtomicUsize, Ordering, spin_hint};
use super::{SpinLock, SpinLockGuard};

/// A condition variable.
///
/// Callers must change the guarded state while holding the lock and notify
/// after releasing it (or while holding it); the waiter always rechecks the
/// predicate after waking, as spurious wakeups are possible.
///
/// # Example
///
/// ```ignore
/// static PENDING: SpinLock<usize> = SpinLock::new(0);
/// static IDLE: Condvar = Condvar::new();
///
/// // Waiter:
/// let guard = IDLE.wait_while(PENDING.lock(), |n| *n != 0);
///
/// // Notifier:
/// *PENDING.lock() -= 1;
/// IDLE.notify_all();
/// ```
pub struct Condvar {
    generation: AtomicUsize,
}

impl Condvar {
    /// Creates a new condition variable.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// Creates a new condition variable.
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// Atomically releases the [`SpinLockGuard`], waits for a notification,
    /// then re-acquires and returns a new guard.
    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let lock: &'a SpinLock<T> = guard.lock_ref();
        let seen = self.generation.load(Ordering::Acquire);
        drop(guard);

        while self.generation.load(Ordering::Acquire) == seen {
            spin_hint();
        }
        lock.lock()
    }

    /// Waits until `condition` returns `false`, returning the guard that
    /// observed it.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: SpinLockGuard<'a, T>,
        mut condition: F,
    ) -> SpinLockGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes one waiter.
    ///
    /// Spinning waiters cannot be told apart, so this wakes every waiter;
    /// callers already recheck their predicate.
    pub fn notify_one(&self) {
        self.notify_all();
    }

    /// Wakes all waiters.
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
