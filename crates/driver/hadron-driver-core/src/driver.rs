//! Drivers.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use hadron_core::sync::SpinLock;

use crate::bus::Bus;
use crate::device::{self, Device};
use crate::error::DriverError;
use crate::klist::{Klist, KlistNode};

/// Entry points a driver provides to the binding core.
///
/// A bus may route these through its own [`BusOps`](crate::bus::BusOps);
/// the defaults there call straight into the driver.
pub trait DriverOps: Send + Sync {
    /// Returns `true` if this driver may handle `dev`.
    ///
    /// Called with the device lock held when a device is attached, and
    /// without it when a new driver walks the bus, so it must not lock `dev`.
    /// The default accepts everything.
    fn matches(&self, dev: &Device) -> bool {
        let _ = dev;
        true
    }

    /// Binds to `dev`. Called with the device lock held.
    ///
    /// Resources registered on `dev` while probing are released again if the
    /// probe fails.
    ///
    /// # Errors
    ///
    /// [`DriverError::NoDevice`] and [`DriverError::NoSuchDevice`] mean "not
    /// my device" and let the next driver try. [`DriverError::ProbeDefer`]
    /// queues the device for a retry. Anything else is logged as a failed
    /// probe.
    fn probe(&self, dev: &Device) -> Result<(), DriverError>;

    /// Unbinds from `dev`. Called with the device lock held.
    fn remove(&self, dev: &Device) {
        let _ = dev;
    }
}

/// A driver registered (or about to be registered) on a bus.
pub struct Driver {
    name: String,
    this: Weak<Driver>,
    bus: Arc<Bus>,
    ops: Box<dyn DriverOps>,
    registered: AtomicBool,
    /// Devices currently bound to this driver.
    pub(crate) devices: Klist<Arc<Device>>,
    pub(crate) knode_bus: SpinLock<Option<KlistNode<Arc<Driver>>>>,
}

impl Driver {
    /// Creates a driver for `bus`. It is registered with
    /// [`Bus::add_driver`].
    pub fn new(name: &str, bus: &Arc<Bus>, ops: impl DriverOps + 'static) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: String::from(name),
            this: Weak::clone(this),
            bus: Arc::clone(bus),
            ops: Box::new(ops),
            registered: AtomicBool::new(false),
            devices: Klist::with_hooks(device::klist_get, device::klist_put),
            knode_bus: SpinLock::new(None),
        })
    }

    /// Returns the driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the bus this driver belongs to.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Returns the driver's entry points.
    pub fn ops(&self) -> &dyn DriverOps {
        &*self.ops
    }

    /// Returns a new strong reference to this driver.
    ///
    /// # Panics
    ///
    /// Panics if called while the last reference is being dropped.
    pub fn arc(&self) -> Arc<Driver> {
        match self.this.upgrade() {
            Some(drv) => drv,
            None => hadron_core::kbug!("driver {}: used during teardown", self.name),
        }
    }

    /// Returns `true` while the driver is on its bus's driver registry.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    /// Returns the devices currently bound to this driver.
    pub fn bound_devices(&self) -> Vec<Arc<Device>> {
        self.devices.snapshot()
    }

    /// Returns the number of devices currently bound to this driver.
    pub fn bound_count(&self) -> usize {
        self.devices.len()
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("bus", &self.bus.name())
            .field("bound", &self.bound_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
