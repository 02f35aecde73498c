//! Identity of the executing context.
//!
//! Spin locks have no owner, so re-acquiring one from the context that holds
//! it just spins. Code that wants to catch that supplies the platform's
//! notion of "who is running" (task or CPU id) through [`set_context_ops`].
//! Without it, [`current_context`] returns `None` and such checks are skipped.

use core::sync::atomic::AtomicPtr;

use super::loom_compat::Ordering;

/// Context identification provided by the platform.
#[derive(Debug, Clone, Copy)]
pub struct ContextOps {
    /// Returns an id unique to the running task (or CPU, before tasks exist).
    pub current: fn() -> usize,
}

static CONTEXT_OPS: AtomicPtr<ContextOps> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the platform's context identification.
pub fn set_context_ops(ops: &'static ContextOps) {
    CONTEXT_OPS.store(core::ptr::from_ref(ops).cast_mut(), Ordering::Release);
}

/// Returns the id of the running context, if the platform supplied one.
pub fn current_context() -> Option<usize> {
    let ptr = CONTEXT_OPS.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: Only `&'static ContextOps` references are ever stored.
    let ops = unsafe { &*ptr };
    Some((ops.current)())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fixed() -> usize {
        42
    }

    static FIXED: ContextOps = ContextOps { current: fixed };

    #[test]
    fn installed_ops_are_used() {
        set_context_ops(&FIXED);
        assert_eq!(current_context(), Some(42));
    }
}
