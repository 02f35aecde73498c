//! Deferred probing.
//!
//! A probe that returns [`DriverError::ProbeDefer`] parks its device on a
//! global pending list. Every successful bind requests a retry, and the next
//! [`flush`] (run by the attach paths once their device locks are dropped)
//! tries each pending device again.
//!
//! [`DriverError::ProbeDefer`]: crate::error::DriverError::ProbeDefer

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use hadron_core::kdebug;
use hadron_core::sync::SpinLock;

use crate::dd;
use crate::device::Device;

static PENDING: SpinLock<Vec<Arc<Device>>> = SpinLock::named("deferred_probe_pending", Vec::new());
static RETRY_REQUESTED: AtomicBool = AtomicBool::new(false);
static FLUSHING: AtomicBool = AtomicBool::new(false);

/// Queues `dev` for another probe attempt.
pub(crate) fn add(dev: &Device) {
    let mut pending = PENDING.lock();
    if !pending.iter().any(|d| core::ptr::eq(Arc::as_ptr(d), dev)) {
        pending.push(dev.arc());
    }
}

/// Drops `dev` from the pending list.
pub(crate) fn forget(dev: &Device) {
    let removed = {
        let mut pending = PENDING.lock();
        pending
            .iter()
            .position(|d| core::ptr::eq(Arc::as_ptr(d), dev))
            .map(|pos| pending.remove(pos))
    };
    // The last reference may go here; never drop a device under the list lock.
    drop(removed);
}

/// Notes that pending devices deserve another attempt.
pub(crate) fn request_retry() {
    RETRY_REQUESTED.store(true, Ordering::Release);
}

/// Retries every pending device now.
pub fn retry_pending() {
    request_retry();
    flush();
}

/// Returns the number of devices waiting for a deferred probe.
pub fn pending_count() -> usize {
    PENDING.lock().len()
}

/// Retries pending devices while retries keep being requested.
///
/// Must be called without any device lock held. If another thread is
/// already flushing, this returns at once and that thread picks up the
/// request.
pub fn flush() {
    loop {
        if FLUSHING.swap(true, Ordering::AcqRel) {
            return;
        }
        while RETRY_REQUESTED.swap(false, Ordering::AcqRel) {
            let batch = core::mem::take(&mut *PENDING.lock());
            if !batch.is_empty() {
                kdebug!("deferred probe: retrying {} devices", batch.len());
            }
            for dev in batch {
                dd::attach_device(&dev);
            }
        }
        FLUSHING.store(false, Ordering::Release);
        // A request that raced with the release of FLUSHING would be lost.
        if !RETRY_REQUESTED.load(Ordering::Acquire) {
            return;
        }
    }
}
