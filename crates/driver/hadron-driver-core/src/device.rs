//! Devices and the device lock.
//!
//! A [`Device`] is a node in the device tree. It may sit on one [`Bus`], may
//! have a parent, and is bound to at most one [`Driver`] at a time. The
//! device lock serialises probe and release for the device; it is taken
//! through [`Device::lock`], and the returned [`DeviceGuard`] is what the
//! binding operations in [`dd`](crate::dd) require as proof.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use hadron_core::sync::{SpinLock, SpinLockGuard, current_context};

use crate::bus::Bus;
use crate::devres::DevresStore;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::klist::KlistNode;

/// Where a device is in the binding state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindState {
    /// No driver is bound or being tried.
    Unmatched = 0,
    /// Drivers are being matched against the device.
    Matching = 1,
    /// A driver's probe is running.
    Probing = 2,
    /// A driver is bound.
    Bound = 3,
}

impl BindState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Matching,
            2 => Self::Probing,
            3 => Self::Bound,
            _ => Self::Unmatched,
        }
    }
}

/// A device in the device tree.
pub struct Device {
    name: String,
    this: Weak<Device>,
    parent: Option<Arc<Device>>,
    bus: Option<Arc<Bus>>,
    /// The device lock. Held across probe and release.
    lock: SpinLock<()>,
    driver: SpinLock<Option<Arc<Driver>>>,
    state: AtomicU8,
    registered: AtomicBool,
    dead: AtomicBool,
    drvdata: SpinLock<Option<Box<dyn Any + Send>>>,
    probe_error: SpinLock<Option<DriverError>>,
    /// Number of lists this device is linked into.
    list_refs: AtomicUsize,
    /// Context id plus one of the thread running the remove hook, or 0.
    releaser: AtomicUsize,
    pub(crate) devres: DevresStore,
    pub(crate) knode_bus: SpinLock<Option<KlistNode<Arc<Device>>>>,
    pub(crate) knode_driver: SpinLock<Option<KlistNode<Arc<Device>>>>,
}

impl Device {
    /// Creates a device that is not yet registered anywhere.
    pub fn new(name: &str, bus: Option<&Arc<Bus>>, parent: Option<&Arc<Device>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: String::from(name),
            this: Weak::clone(this),
            parent: parent.cloned(),
            bus: bus.cloned(),
            lock: SpinLock::named("device_lock", ()),
            driver: SpinLock::new(None),
            state: AtomicU8::new(BindState::Unmatched as u8),
            registered: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            drvdata: SpinLock::new(None),
            probe_error: SpinLock::new(None),
            list_refs: AtomicUsize::new(0),
            releaser: AtomicUsize::new(0),
            devres: DevresStore::new(),
            knode_bus: SpinLock::new(None),
            knode_driver: SpinLock::new(None),
        })
    }

    /// Returns the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the parent device, if any.
    pub fn parent(&self) -> Option<&Arc<Device>> {
        self.parent.as_ref()
    }

    /// Returns the bus this device belongs to, if any.
    pub fn bus(&self) -> Option<&Arc<Bus>> {
        self.bus.as_ref()
    }

    /// Returns a new strong reference to this device.
    ///
    /// # Panics
    ///
    /// Panics if called while the last reference is being dropped.
    pub fn arc(&self) -> Arc<Device> {
        match self.this.upgrade() {
            Some(dev) => dev,
            None => hadron_core::kbug!("device {}: used during teardown", self.name),
        }
    }

    /// Acquires the device lock.
    ///
    /// # Panics
    ///
    /// Panics if called from the remove hook or a resource release of this
    /// same device, which would otherwise spin forever on its own lock.
    /// Detected only once the platform has installed
    /// [`ContextOps`](hadron_core::sync::ContextOps).
    pub fn lock(&self) -> DeviceGuard<'_> {
        self.check_reentry();
        DeviceGuard {
            _held: self.lock.lock(),
            dev: self,
        }
    }

    /// Tries to acquire the device lock without spinning.
    pub fn try_lock(&self) -> Option<DeviceGuard<'_>> {
        self.lock.try_lock().map(|held| DeviceGuard { _held: held, dev: self })
    }

    /// Returns the driver currently attached to this device.
    ///
    /// This may be a driver that is mid-probe or preassigned, see
    /// [`is_bound`](Self::is_bound).
    pub fn driver(&self) -> Option<Arc<Driver>> {
        self.driver.lock().clone()
    }

    pub(crate) fn set_driver(&self, drv: Option<Arc<Driver>>) {
        *self.driver.lock() = drv;
    }

    /// Names a driver for this device ahead of registration.
    ///
    /// When the device is added, the binding core attaches it to `drv`
    /// without probing.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Busy`] if the device is registered or already
    /// has a driver.
    pub fn preassign_driver(&self, drv: &Arc<Driver>) -> Result<(), DriverError> {
        let mut slot = self.driver.lock();
        if slot.is_some() || self.is_registered() {
            return Err(DriverError::Busy);
        }
        *slot = Some(Arc::clone(drv));
        Ok(())
    }

    /// Returns `true` if a driver is bound (its probe succeeded and the
    /// device is on the driver's device list).
    pub fn is_bound(&self) -> bool {
        self.knode_driver
            .lock()
            .as_ref()
            .is_some_and(KlistNode::is_attached)
    }

    /// Returns the current binding state.
    pub fn bind_state(&self) -> BindState {
        BindState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_bind_state(&self, state: BindState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns `true` once the device has been added to its bus and until it
    /// is removed.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    /// Returns `true` once the device has started going away. No new probes
    /// are started for a dead device.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Returns the error of the last failed probe, cleared by a successful
    /// bind.
    pub fn probe_error(&self) -> Option<DriverError> {
        *self.probe_error.lock()
    }

    pub(crate) fn set_probe_error(&self, err: Option<DriverError>) {
        *self.probe_error.lock() = err;
    }

    /// Stores driver-private data. Replaces any previous value.
    pub fn set_drvdata<T: Any + Send>(&self, data: T) {
        *self.drvdata.lock() = Some(Box::new(data));
    }

    /// Runs `f` on the driver-private data if it is a `T`.
    pub fn with_drvdata<T: Any + Send, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let data = self.drvdata.lock();
        data.as_ref().and_then(|d| d.downcast_ref::<T>()).map(f)
    }

    /// Takes the driver-private data out if it is a `T`.
    pub fn take_drvdata<T: Any + Send>(&self) -> Option<Box<T>> {
        let mut data = self.drvdata.lock();
        if data.as_ref().is_some_and(|d| d.is::<T>()) {
            data.take().and_then(|d| d.downcast::<T>().ok())
        } else {
            None
        }
    }

    pub(crate) fn clear_drvdata(&self) {
        // Dropped outside the lock; the destructor may log or take locks.
        let old = self.drvdata.lock().take();
        drop(old);
    }

    /// Aborts if the calling context is releasing this device.
    pub(crate) fn check_reentry(&self) {
        let owner = self.releaser.load(Ordering::Acquire);
        if owner != 0 && current_context().is_some_and(|ctx| ctx.wrapping_add(1) == owner) {
            hadron_core::kbug!("device {}: recursive release", self.name);
        }
    }

    /// Marks the calling context as releasing this device until the mark
    /// is dropped.
    pub(crate) fn mark_releasing(&self) -> ReleaseMark<'_> {
        let owner = current_context().map_or(0, |ctx| ctx.wrapping_add(1));
        self.releaser.store(owner, Ordering::Release);
        ReleaseMark { dev: self }
    }

    /// Returns the number of lists (bus registry, driver device list) this
    /// device is currently linked into.
    pub fn list_refs(&self) -> usize {
        self.list_refs.load(Ordering::Acquire)
    }
}

/// Set while the device's driver is being released. See
/// [`Device::mark_releasing`].
pub(crate) struct ReleaseMark<'a> {
    dev: &'a Device,
}

impl Drop for ReleaseMark<'_> {
    fn drop(&mut self) {
        self.dev.releaser.store(0, Ordering::Release);
    }
}

/// Klist hook: a list took a reference to the device.
pub(crate) fn klist_get(dev: &Arc<Device>) {
    dev.list_refs.fetch_add(1, Ordering::AcqRel);
}

/// Klist hook: a list dropped its reference to the device.
pub(crate) fn klist_put(dev: &Arc<Device>) {
    dev.list_refs.fetch_sub(1, Ordering::AcqRel);
}

impl Drop for Device {
    fn drop(&mut self) {
        // Anything the driver left behind goes with the device.
        self.devres_release_all();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.bind_state())
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Proof that the device lock is held.
///
/// Dereferences to the [`Device`].
pub struct DeviceGuard<'a> {
    _held: SpinLockGuard<'a, ()>,
    dev: &'a Device,
}

impl DeviceGuard<'_> {
    /// Returns the locked device.
    pub fn device(&self) -> &Device {
        self.dev
    }
}

impl Deref for DeviceGuard<'_> {
    type Target = Device;

    fn deref(&self) -> &Device {
        self.dev
    }
}

impl fmt::Debug for DeviceGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceGuard").field(&self.dev.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_is_unbound() {
        let dev = Device::new("uart0", None, None);
        assert_eq!(dev.name(), "uart0");
        assert_eq!(dev.bind_state(), BindState::Unmatched);
        assert!(!dev.is_registered());
        assert!(!dev.is_bound());
        assert!(dev.driver().is_none());
        assert_eq!(dev.list_refs(), 0);
    }

    #[test]
    fn parent_is_kept() {
        let parent = Device::new("pci0", None, None);
        let child = Device::new("nvme0", None, Some(&parent));
        assert!(Arc::ptr_eq(child.parent().unwrap(), &parent));
    }

    #[test]
    fn lock_excludes_second_locker() {
        let dev = Device::new("lockme", None, None);
        let guard = dev.lock();
        assert!(dev.try_lock().is_none());
        assert_eq!(guard.name(), "lockme");
        drop(guard);
        assert!(dev.try_lock().is_some());
    }

    #[test]
    fn drvdata_is_typed() {
        let dev = Device::new("data", None, None);
        dev.set_drvdata(42u32);
        assert_eq!(dev.with_drvdata(|v: &u32| *v), Some(42));
        assert_eq!(dev.with_drvdata(|_: &u64| ()), None);
        assert!(dev.take_drvdata::<u64>().is_none());
        assert_eq!(dev.take_drvdata::<u32>().map(|b| *b), Some(42));
        assert!(dev.with_drvdata(|_: &u32| ()).is_none());
    }

    fn test_context() -> usize {
        use std::sync::atomic::AtomicUsize;
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        std::thread_local!(static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed));
        ID.with(|id| *id)
    }

    static TEST_CONTEXT: hadron_core::sync::ContextOps = hadron_core::sync::ContextOps {
        current: test_context,
    };

    #[test]
    #[should_panic(expected = "recursive release")]
    fn relock_while_releasing_is_fatal() {
        hadron_core::sync::set_context_ops(&TEST_CONTEXT);
        let dev = Device::new("reent", None, None);
        let _held = dev.lock();
        let _mark = dev.mark_releasing();
        let _again = dev.lock();
    }

    #[test]
    fn other_context_waits_for_release() {
        hadron_core::sync::set_context_ops(&TEST_CONTEXT);
        let dev = Device::new("waiter", None, None);
        let held = dev.lock();
        let mark = dev.mark_releasing();
        let other = Arc::clone(&dev);
        let waiter = std::thread::spawn(move || {
            let guard = other.lock();
            guard.name().len()
        });
        drop(mark);
        drop(held);
        assert_eq!(waiter.join().unwrap(), 6);
    }

    #[test]
    fn arc_returns_same_device() {
        let dev = Device::new("self", None, None);
        assert!(Arc::ptr_eq(&dev.arc(), &dev));
    }
}
