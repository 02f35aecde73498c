//! Buses: the registries of devices and drivers that can be matched.
//!
//! A [`Bus`] keeps two [`Klist`]s, one of devices and one of drivers, and
//! walks them without holding any lock across the caller's visit. Adding a
//! device or driver triggers automatic probing when the bus has
//! [`BusFlags::AUTOPROBE`] set.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use hadron_core::sync::SpinLock;
use hadron_core::{kdebug, kinfo};

use crate::dd;
use crate::deferred;
use crate::device::{self, Device};
use crate::driver::Driver;
use crate::error::DriverError;
use crate::klist::{Klist, KlistIter};
use crate::links::{NoLinks, ObjectLinks};

bitflags! {
    /// Bus behaviour switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BusFlags: u32 {
        /// Probe automatically when devices or drivers are added.
        const AUTOPROBE = 1 << 0;
        /// Take the parent's device lock before a device's own lock.
        const NEED_PARENT_LOCK = 1 << 1;
    }
}

/// Bus-level hooks. The defaults defer to the driver's [`DriverOps`].
///
/// [`DriverOps`]: crate::driver::DriverOps
pub trait BusOps: Send + Sync {
    /// Returns `true` if `drv` may handle `dev`. Locking is as for
    /// [`DriverOps::matches`].
    fn matches(&self, dev: &Device, drv: &Driver) -> bool {
        drv.ops().matches(dev)
    }

    /// Probes `drv` against `dev`. Called with the device lock held.
    ///
    /// # Errors
    ///
    /// See [`DriverOps::probe`](crate::driver::DriverOps::probe).
    fn probe(&self, dev: &Device, drv: &Driver) -> Result<(), DriverError> {
        drv.ops().probe(dev)
    }

    /// Unbinds `drv` from `dev`. Called with the device lock held.
    fn remove(&self, dev: &Device, drv: &Driver) {
        drv.ops().remove(dev);
    }
}

/// Bus hooks that call straight into the driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBusOps;

impl BusOps for DefaultBusOps {}

/// Binding events reported to bus notifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// A device was added to the bus.
    AddDevice,
    /// A device is about to be removed from the bus.
    DelDevice,
    /// A driver is about to be probed against the device.
    BindDriver,
    /// A driver was bound to the device.
    BoundDriver,
    /// A driver is about to be unbound from the device.
    UnbindDriver,
    /// A driver was unbound from the device.
    UnboundDriver,
    /// A probe failed and the device was left without a driver.
    DriverNotBound,
}

/// Observer of a bus's binding events.
///
/// Called synchronously; for binding events the device lock is held.
pub trait BusNotifier: Send + Sync {
    /// Handles `event` for `dev`.
    fn notify(&self, event: BusEvent, dev: &Device);
}

/// Construction-time bus configuration.
pub struct BusConfig {
    flags: BusFlags,
    links: Arc<dyn ObjectLinks>,
}

impl BusConfig {
    /// Default configuration: autoprobe on, parent lock off, no exported
    /// links.
    pub fn new() -> Self {
        Self {
            flags: BusFlags::AUTOPROBE,
            links: Arc::new(NoLinks),
        }
    }

    /// Enables or disables automatic probing.
    #[must_use]
    pub fn autoprobe(mut self, enabled: bool) -> Self {
        self.flags.set(BusFlags::AUTOPROBE, enabled);
        self
    }

    /// Requires the parent's lock to be held while probing a child.
    #[must_use]
    pub fn need_parent_lock(mut self, enabled: bool) -> Self {
        self.flags.set(BusFlags::NEED_PARENT_LOCK, enabled);
        self
    }

    /// Sets the exported-hierarchy collaborator.
    #[must_use]
    pub fn links(mut self, links: Arc<dyn ObjectLinks>) -> Self {
        self.links = links;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A bus with its device and driver registries.
pub struct Bus {
    name: String,
    ops: Box<dyn BusOps>,
    flags: AtomicU32,
    links: Arc<dyn ObjectLinks>,
    devices: Klist<Arc<Device>>,
    drivers: Klist<Arc<Driver>>,
    /// Serialises the name check and insertion of registrations.
    register_lock: SpinLock<()>,
    notifiers: SpinLock<Vec<Arc<dyn BusNotifier>>>,
}

impl Bus {
    /// Creates a bus.
    pub fn new(name: &str, ops: impl BusOps + 'static, config: BusConfig) -> Arc<Self> {
        kdebug!("bus {}: registered", name);
        Arc::new(Self {
            name: String::from(name),
            ops: Box::new(ops),
            flags: AtomicU32::new(config.flags.bits()),
            links: config.links,
            devices: Klist::with_hooks(device::klist_get, device::klist_put),
            drivers: Klist::new(),
            register_lock: SpinLock::named("bus_register", ()),
            notifiers: SpinLock::named("bus_notifiers", Vec::new()),
        })
    }

    /// Returns the bus name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the bus hooks.
    pub fn ops(&self) -> &dyn BusOps {
        &*self.ops
    }

    /// Returns the exported-hierarchy collaborator.
    pub fn links(&self) -> &dyn ObjectLinks {
        &*self.links
    }

    /// Returns the current flags.
    pub fn flags(&self) -> BusFlags {
        BusFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Returns `true` if adding devices or drivers probes automatically.
    pub fn autoprobe(&self) -> bool {
        self.flags().contains(BusFlags::AUTOPROBE)
    }

    /// Turns automatic probing on or off.
    pub fn set_autoprobe(&self, enabled: bool) {
        if enabled {
            self.flags.fetch_or(BusFlags::AUTOPROBE.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!BusFlags::AUTOPROBE.bits(), Ordering::AcqRel);
        }
    }

    /// Returns `true` if a child's parent must be locked before the child.
    pub fn need_parent_lock(&self) -> bool {
        self.flags().contains(BusFlags::NEED_PARENT_LOCK)
    }

    // -- Notifiers ----------------------------------------------------------

    /// Registers an event observer.
    pub fn register_notifier(&self, notifier: Arc<dyn BusNotifier>) {
        self.notifiers.lock().push(notifier);
    }

    /// Unregisters an observer added with
    /// [`register_notifier`](Self::register_notifier). Returns `false` if it
    /// was not registered.
    pub fn unregister_notifier(&self, notifier: &Arc<dyn BusNotifier>) -> bool {
        let mut notifiers = self.notifiers.lock();
        let before = notifiers.len();
        notifiers.retain(|n| !Arc::ptr_eq(n, notifier));
        notifiers.len() != before
    }

    pub(crate) fn notify(&self, event: BusEvent, dev: &Device) {
        let notifiers = self.notifiers.lock().clone();
        for notifier in notifiers {
            notifier.notify(event, dev);
        }
    }

    // -- Walks --------------------------------------------------------------

    /// Calls `visit` for each device on the bus, in registration order,
    /// until it breaks.
    ///
    /// With `start`, the walk resumes after that device. No registry lock is
    /// held while `visit` runs, so it may add or remove devices.
    pub fn for_each_device<B>(
        &self,
        start: Option<&Arc<Device>>,
        mut visit: impl FnMut(&Arc<Device>) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let walk = match start {
            // Park before the node lock drops, so a racing removal cannot
            // unlink the start in between.
            Some(dev) => KlistIter::new_at(&self.devices, dev.knode_bus.lock().as_ref()),
            None => KlistIter::new(&self.devices),
        };
        for dev in walk {
            visit(&dev)?;
        }
        ControlFlow::Continue(())
    }

    /// Returns the first device after `start` accepted by `pred`.
    pub fn find_device(
        &self,
        start: Option<&Arc<Device>>,
        mut pred: impl FnMut(&Device) -> bool,
    ) -> Option<Arc<Device>> {
        match self.for_each_device(start, |dev| {
            if pred(dev) {
                ControlFlow::Break(Arc::clone(dev))
            } else {
                ControlFlow::Continue(())
            }
        }) {
            ControlFlow::Break(dev) => Some(dev),
            ControlFlow::Continue(()) => None,
        }
    }

    /// Returns the device named `name`.
    pub fn find_device_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.find_device(None, |dev| dev.name() == name)
    }

    /// Calls `visit` for each driver on the bus, in registration order,
    /// until it breaks. Same resumption rules as
    /// [`for_each_device`](Self::for_each_device).
    pub fn for_each_driver<B>(
        &self,
        start: Option<&Arc<Driver>>,
        mut visit: impl FnMut(&Arc<Driver>) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let walk = match start {
            Some(drv) => KlistIter::new_at(&self.drivers, drv.knode_bus.lock().as_ref()),
            None => KlistIter::new(&self.drivers),
        };
        for drv in walk {
            visit(&drv)?;
        }
        ControlFlow::Continue(())
    }

    /// Returns the driver named `name`.
    pub fn find_driver(&self, name: &str) -> Option<Arc<Driver>> {
        match self.for_each_driver(None, |drv| {
            if drv.name() == name {
                ControlFlow::Break(Arc::clone(drv))
            } else {
                ControlFlow::Continue(())
            }
        }) {
            ControlFlow::Break(drv) => Some(drv),
            ControlFlow::Continue(()) => None,
        }
    }

    /// Returns the number of devices on the bus.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Returns the number of drivers on the bus.
    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    // -- Registration -------------------------------------------------------

    fn check_owner(&self, owner: Option<&Arc<Bus>>, what: &str) -> Result<(), DriverError> {
        match owner {
            Some(bus) if core::ptr::eq(Arc::as_ptr(bus), self) => Ok(()),
            _ => {
                kdebug!("bus {}: {} belongs to another bus", self.name, what);
                Err(DriverError::InvalidArgument)
            }
        }
    }

    /// Adds `dev` to the device registry and, with autoprobe on, tries to
    /// bind it.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidArgument`] if `dev` was created for another
    /// bus, [`DriverError::AlreadyExists`] if it is already registered or a
    /// device with the same name is.
    pub fn add_device(&self, dev: &Arc<Device>) -> Result<(), DriverError> {
        self.check_owner(dev.bus(), dev.name())?;
        {
            let _register = self.register_lock.lock();
            let mut knode = dev.knode_bus.lock();
            if knode.is_some() || self.find_device_by_name(dev.name()).is_some() {
                return Err(DriverError::AlreadyExists);
            }
            dev.set_registered(true);
            *knode = Some(self.devices.add_tail(Arc::clone(dev)));
        }
        kdebug!("bus {}: add device {}", self.name, dev.name());
        self.notify(BusEvent::AddDevice, dev);

        if self.autoprobe() {
            dd::attach_device(dev);
        }
        Ok(())
    }

    /// Unbinds `dev` and removes it from the device registry.
    ///
    /// Returns `false` if the device was not registered on this bus.
    pub fn remove_device(&self, dev: &Arc<Device>) -> bool {
        let Some(knode) = dev.knode_bus.lock().take() else {
            return false;
        };
        // No new probes from here on.
        dev.kill();
        self.notify(BusEvent::DelDevice, dev);
        deferred::forget(dev);
        self.devices.del(&knode);
        dd::unbind_device(dev);
        dev.set_registered(false);
        kdebug!("bus {}: removed device {}", self.name, dev.name());
        true
    }

    /// Adds `drv` to the driver registry and, with autoprobe on, binds it to
    /// every matching unbound device.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidArgument`] if `drv` was created for another
    /// bus, [`DriverError::Busy`] if a driver with the same name is
    /// registered.
    pub fn add_driver(&self, drv: &Arc<Driver>) -> Result<(), DriverError> {
        self.check_owner(Some(drv.bus()), drv.name())?;
        {
            let _register = self.register_lock.lock();
            let mut knode = drv.knode_bus.lock();
            if knode.is_some() || self.find_driver(drv.name()).is_some() {
                kinfo!("bus {}: driver {} is already registered", self.name, drv.name());
                return Err(DriverError::Busy);
            }
            drv.set_registered(true);
            *knode = Some(self.drivers.add_tail(Arc::clone(drv)));
        }
        kdebug!("bus {}: add driver {}", self.name, drv.name());

        if self.autoprobe() {
            dd::attach_driver(drv)?;
        }
        Ok(())
    }

    /// Removes `drv` from the driver registry and unbinds it from every
    /// device.
    ///
    /// Returns `false` if the driver was not registered on this bus.
    pub fn remove_driver(&self, drv: &Arc<Driver>) -> bool {
        let Some(knode) = drv.knode_bus.lock().take() else {
            return false;
        };
        drv.set_registered(false);
        self.drivers.del(&knode);
        kdebug!("bus {}: remove driver {}", self.name, drv.name());
        dd::detach_driver(drv);
        true
    }

    /// Tries to bind every device on the bus that has no driver.
    ///
    /// Returns the number of devices that ended up bound.
    pub fn rescan_devices(&self) -> usize {
        let mut bound = 0;
        let _ = self.for_each_device(None, |dev| {
            if dev.driver().is_none() && dd::attach_device(dev) == dd::BindOutcome::Bound {
                bound += 1;
            }
            ControlFlow::<()>::Continue(())
        });
        bound
    }

    /// Removes every driver and then every device.
    pub fn unregister(&self) {
        while let Some(drv) = self.drivers.last() {
            self.remove_driver(&drv);
        }
        while let Some(dev) = self.devices.last() {
            self.remove_device(&dev);
        }
        kdebug!("bus {}: unregistered", self.name);
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("flags", &self.flags())
            .field("devices", &self.device_count())
            .field("drivers", &self.driver_count())
            .finish_non_exhaustive()
    }
}
