//! Binding devices to drivers.
//!
//! Every probe and release runs with the device lock held; the functions
//! that need it take a [`DeviceGuard`] so the requirement cannot be skipped.
//! Lock order is parent device, then device, then the bus and driver lists
//! (which are only ever held for a cursor step).
//!
//! A global counter tracks probes in flight so that
//! [`wait_for_quiescence`] can block until the system settles.

use alloc::sync::Arc;
use core::ops::{ControlFlow, Deref};

use hadron_core::sync::{Condvar, SpinLock};
use hadron_core::{kdebug, kinfo, kwarn};

use crate::bus::BusEvent;
use crate::deferred;
use crate::device::{BindState, Device, DeviceGuard};
use crate::driver::Driver;
use crate::error::DriverError;

/// Result of trying to bind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The device is not (or no longer) registered; nothing was tried.
    NotRegistered,
    /// A driver is bound to the device.
    Bound,
    /// No driver was bound.
    NotBound,
}

// ---------------------------------------------------------------------------
// Probe tracking
// ---------------------------------------------------------------------------

static PROBES_IN_FLIGHT: SpinLock<usize> = SpinLock::named("probes_in_flight", 0);
static PROBES_IDLE: Condvar = Condvar::new();

/// Marks one probe as running for as long as it lives.
struct ProbeInFlight;

impl ProbeInFlight {
    fn enter() -> Self {
        *PROBES_IN_FLIGHT.lock() += 1;
        Self
    }
}

impl Drop for ProbeInFlight {
    fn drop(&mut self) {
        *PROBES_IN_FLIGHT.lock() -= 1;
        PROBES_IDLE.notify_all();
    }
}

/// Returns the number of probes currently running.
pub fn probes_in_flight() -> usize {
    *PROBES_IN_FLIGHT.lock()
}

/// Blocks until no probe is running anywhere.
///
/// Pending deferred probes are retried first. Must not be called from a
/// probe, which would wait for itself.
pub fn wait_for_quiescence() {
    deferred::flush();
    let _idle = PROBES_IDLE.wait_while(PROBES_IN_FLIGHT.lock(), |n| *n != 0);
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

/// A device lock, plus its parent's when the bus asks for it.
///
/// Dereferences to the device's [`DeviceGuard`].
pub struct LockedDevice<'a> {
    // Declared first so the child unlocks before the parent.
    dev: DeviceGuard<'a>,
    _parent: Option<DeviceGuard<'a>>,
}

impl<'a> Deref for LockedDevice<'a> {
    type Target = DeviceGuard<'a>;

    fn deref(&self) -> &DeviceGuard<'a> {
        &self.dev
    }
}

/// Locks `dev`, taking its parent's lock first if the bus requires it.
///
/// # Panics
///
/// Panics if called while the same context is releasing `dev`.
pub fn lock_device(dev: &Device) -> LockedDevice<'_> {
    dev.check_reentry();
    let parent = dev
        .parent()
        .filter(|_| dev.bus().is_some_and(|bus| bus.need_parent_lock()))
        .map(|parent| parent.lock());
    LockedDevice {
        dev: dev.lock(),
        _parent: parent,
    }
}

// ---------------------------------------------------------------------------
// Bind and probe
// ---------------------------------------------------------------------------

/// Completes a bind: links the device into the driver's list.
fn driver_bound(drv: &Arc<Driver>, dev: &DeviceGuard<'_>) {
    if dev.is_bound() {
        kwarn!("device {}: already bound to {}", dev.name(), drv.name());
        return;
    }
    *dev.knode_driver.lock() = Some(drv.devices.add_tail(dev.arc()));
    dev.set_probe_error(None);
    dev.set_bind_state(BindState::Bound);
    kinfo!("driver {}: bound to device {}", drv.name(), dev.name());

    // A new binding may satisfy what deferred devices were waiting for.
    deferred::forget(dev);
    deferred::request_retry();
    drv.bus().notify(BusEvent::BoundDriver, dev);
}

/// Binds the driver already recorded on the device, without probing.
///
/// Used for devices whose driver was assigned before registration.
///
/// # Errors
///
/// [`DriverError::InvalidArgument`] if no driver is recorded, or whatever
/// the link collaborator returned.
pub fn bind_driver(dev: &DeviceGuard<'_>) -> Result<(), DriverError> {
    let drv = dev.driver().ok_or(DriverError::InvalidArgument)?;
    let bus = drv.bus();
    bus.notify(BusEvent::BindDriver, dev);
    if let Err(err) = bus.links().create_links(dev, &drv) {
        kwarn!("driver {}: cannot link device {}: {}", drv.name(), dev.name(), err);
        dev.set_driver(None);
        bus.notify(BusEvent::DriverNotBound, dev);
        return Err(err);
    }
    driver_bound(&drv, dev);
    Ok(())
}

/// Probes `drv` against the locked device.
///
/// On success the device is bound. On failure every resource registered
/// during the probe is released and the device is left without a driver;
/// a deferral queues the device for a retry.
///
/// # Errors
///
/// The "not my device" codes ([`DriverError::is_rejection`]) are returned
/// unchanged so callers can move on to the next driver.
/// [`DriverError::Busy`] is returned if the device already has a driver.
/// Other probe failures are logged and reported as
/// [`BindOutcome::NotBound`].
pub fn probe_device(drv: &Arc<Driver>, dev: &DeviceGuard<'_>) -> Result<BindOutcome, DriverError> {
    if !dev.is_registered() || dev.is_dead() || !drv.is_registered() {
        return Ok(BindOutcome::NotRegistered);
    }
    if dev.driver().is_some() {
        return Err(DriverError::Busy);
    }

    let _inflight = ProbeInFlight::enter();
    let bus = drv.bus();
    kdebug!("bus {}: probing driver {} with device {}", bus.name(), drv.name(), dev.name());

    dev.set_bind_state(BindState::Probing);
    dev.set_driver(Some(Arc::clone(drv)));
    bus.notify(BusEvent::BindDriver, dev);

    let result = match bus.links().create_links(dev, drv) {
        Ok(()) => {
            let probed = bus.ops().probe(dev, drv);
            if probed.is_err() {
                bus.links().remove_links(dev, drv);
            }
            probed
        }
        Err(err) => Err(err),
    };

    let Err(err) = result else {
        driver_bound(drv, dev);
        return Ok(BindOutcome::Bound);
    };

    let released = dev.devres_release_all();
    dev.set_driver(None);
    dev.clear_drvdata();
    dev.set_bind_state(BindState::Unmatched);
    bus.notify(BusEvent::DriverNotBound, dev);

    match err {
        err if err.is_rejection() => {
            kdebug!("driver {}: does not handle device {}: {}", drv.name(), dev.name(), err);
            Err(err)
        }
        DriverError::ProbeDefer => {
            kinfo!("driver {}: deferring probe of device {}", drv.name(), dev.name());
            dev.set_probe_error(Some(err));
            deferred::add(dev);
            Ok(BindOutcome::NotBound)
        }
        err => {
            kwarn!(
                "driver {}: probe of device {} failed: {} ({} resources released)",
                drv.name(),
                dev.name(),
                err,
                released
            );
            dev.set_probe_error(Some(err));
            Ok(BindOutcome::NotBound)
        }
    }
}

/// Tries to bind `dev` to a driver on its bus.
///
/// Drivers are tried in registration order until one binds; a driver that
/// rejects the device or fails its probe does not stop the walk. A device
/// with a preassigned driver is bound to it without probing.
pub fn attach_device(dev: &Arc<Device>) -> BindOutcome {
    let outcome = {
        let locked = lock_device(dev);
        attach_locked(dev, &locked)
    };
    deferred::flush();
    outcome
}

fn attach_locked(dev: &Arc<Device>, locked: &DeviceGuard<'_>) -> BindOutcome {
    if !dev.is_registered() || dev.is_dead() {
        return BindOutcome::NotRegistered;
    }
    if dev.driver().is_some() {
        if dev.is_bound() {
            return BindOutcome::Bound;
        }
        return match bind_driver(locked) {
            Ok(()) => BindOutcome::Bound,
            Err(_) => BindOutcome::NotBound,
        };
    }
    let Some(bus) = dev.bus() else {
        return BindOutcome::NotBound;
    };

    let flow = bus.for_each_driver(None, |drv| {
        dev.set_bind_state(BindState::Matching);
        if !bus.ops().matches(dev, drv) {
            return ControlFlow::Continue(());
        }
        match probe_device(drv, locked) {
            Ok(BindOutcome::Bound) => ControlFlow::Break(BindOutcome::Bound),
            Ok(BindOutcome::NotRegistered) => ControlFlow::Break(BindOutcome::NotRegistered),
            Ok(BindOutcome::NotBound) | Err(_) => ControlFlow::Continue(()),
        }
    });
    match flow {
        ControlFlow::Break(outcome) => outcome,
        ControlFlow::Continue(()) => {
            dev.set_bind_state(BindState::Unmatched);
            BindOutcome::NotBound
        }
    }
}

/// Tries to bind `drv` to every matching device on its bus that has no
/// driver.
///
/// Returns the number of devices bound by this call.
///
/// # Errors
///
/// [`DriverError::InvalidArgument`] if the driver is not registered.
pub fn attach_driver(drv: &Arc<Driver>) -> Result<usize, DriverError> {
    if !drv.is_registered() {
        return Err(DriverError::InvalidArgument);
    }
    let bus = drv.bus();
    let mut bound = 0;
    let _ = bus.for_each_device(None, |dev| {
        if !bus.ops().matches(dev, drv) {
            return ControlFlow::<()>::Continue(());
        }
        let locked = lock_device(dev);
        if locked.driver().is_none() && probe_device(drv, &locked) == Ok(BindOutcome::Bound) {
            bound += 1;
        }
        ControlFlow::Continue(())
    });
    deferred::flush();
    Ok(bound)
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// Unbinds the locked device from its driver.
///
/// Runs the remove hook, releases all of the device's managed resources,
/// clears the driver and unlinks the device from the driver's list. Does
/// nothing if the device has no driver.
///
/// The remove hook and resource releases may unbind other devices, but
/// locking this one again from them is reported with `kbug!`.
pub fn release_driver(dev: &DeviceGuard<'_>) {
    let Some(drv) = dev.driver() else {
        return;
    };
    let bus = drv.bus();
    bus.notify(BusEvent::UnbindDriver, dev);

    let releasing = dev.mark_releasing();
    if dev.is_bound() {
        bus.links().remove_links(dev, &drv);
        bus.ops().remove(dev, &drv);
    }
    dev.devres_release_all();
    drop(releasing);
    dev.set_driver(None);
    dev.clear_drvdata();
    let knode = dev.knode_driver.lock().take();
    if let Some(knode) = knode {
        drv.devices.del(&knode);
    }
    dev.set_bind_state(BindState::Unmatched);

    bus.notify(BusEvent::UnboundDriver, dev);
    kinfo!("driver {}: unbound from device {}", drv.name(), dev.name());
}

/// Locks `dev` (and its parent when required) and unbinds it.
pub fn unbind_device(dev: &Device) {
    let locked = lock_device(dev);
    release_driver(&locked);
}

/// Unbinds `drv` from every device it is bound to.
///
/// Devices are taken newest-first, each under its own lock. A device that
/// was unbound concurrently has already left the list and is skipped.
pub fn detach_driver(drv: &Arc<Driver>) {
    while let Some(dev) = drv.devices.last() {
        let locked = lock_device(&dev);
        if dev.driver().is_some_and(|cur| Arc::ptr_eq(&cur, drv)) {
            release_driver(&locked);
        }
    }
}
