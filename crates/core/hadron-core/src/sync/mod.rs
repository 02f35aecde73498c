//! Synchronization primitives for the driver core.
//!
//! Provides [`SpinLock`] for list and table locks, [`IrqSpinLock`] for state
//! that may be touched from contexts that cannot block, and [`Condvar`] for
//! waiting until a predicate over lock-protected state becomes true.
//! [`current_context`] lets callers detect re-entry on an ownerless lock.

mod condvar;
mod context;
mod irq_spinlock;
mod spinlock;

pub(crate) mod loom_compat;

pub use condvar::Condvar;
pub use context::{ContextOps, current_context, set_context_ops};
pub use irq_spinlock::{IrqOps, IrqSpinLock, IrqSpinLockGuard, set_irq_ops};
pub use spinlock::{SpinLock, SpinLockGuard};
