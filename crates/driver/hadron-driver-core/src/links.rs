//! Links between devices and drivers in the exported object hierarchy.
//!
//! The binding core does not own the exported hierarchy (the filesystem view
//! of buses, devices and drivers). It only tells a collaborator when a
//! device/driver pair must be cross-linked and when that link goes away.

use alloc::string::String;
use alloc::vec::Vec;

use hadron_core::sync::SpinLock;

use crate::device::Device;
use crate::driver::Driver;
use crate::error::DriverError;

/// Collaborator that maintains the device/driver cross-links.
pub trait ObjectLinks: Send + Sync {
    /// Creates the links for `dev` bound to `drv`.
    ///
    /// # Errors
    ///
    /// A failure aborts the bind before the driver's probe runs.
    fn create_links(&self, dev: &Device, drv: &Driver) -> Result<(), DriverError>;

    /// Removes the links created by [`create_links`](Self::create_links).
    fn remove_links(&self, dev: &Device, drv: &Driver);
}

/// Collaborator for systems without an exported hierarchy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLinks;

impl ObjectLinks for NoLinks {
    fn create_links(&self, _dev: &Device, _drv: &Driver) -> Result<(), DriverError> {
        Ok(())
    }

    fn remove_links(&self, _dev: &Device, _drv: &Driver) {}
}

/// An in-memory link table, one `(driver, device)` entry per bound pair.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: SpinLock<Vec<(String, String)>>,
}

impl LinkTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            links: SpinLock::named("link_table", Vec::new()),
        }
    }

    /// Returns the current links as `(driver, device)` pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        self.links.lock().clone()
    }

    /// Returns `true` if `dev` is linked to `drv`.
    pub fn is_linked(&self, drv: &str, dev: &str) -> bool {
        self.links.lock().iter().any(|(d, v)| d == drv && v == dev)
    }
}

impl ObjectLinks for LinkTable {
    fn create_links(&self, dev: &Device, drv: &Driver) -> Result<(), DriverError> {
        let mut links = self.links.lock();
        if links.iter().any(|(_, v)| v == dev.name()) {
            return Err(DriverError::AlreadyExists);
        }
        links
            .try_reserve(1)
            .map_err(|_| DriverError::OutOfMemory)?;
        links.push((String::from(drv.name()), String::from(dev.name())));
        Ok(())
    }

    fn remove_links(&self, dev: &Device, drv: &Driver) {
        self.links
            .lock()
            .retain(|(d, v)| !(d == drv.name() && v == dev.name()));
    }
}
