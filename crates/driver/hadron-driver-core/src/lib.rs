//! Device/driver binding engine for the Hadron kernel.
//!
//! This crate decides which driver handles which device and makes sure
//! that everything a driver acquired for a device is released when the
//! binding ends:
//!
//! - [`bus`]: per-bus registries of devices and drivers, walked with
//!   mutation-tolerant iterators ([`klist`]).
//! - [`dd`]: probe, bind and release under the device lock, plus the global
//!   quiescence wait.
//! - [`devres`]: per-device managed resources, released newest-first and
//!   grouped with open/close markers.
//! - [`kobj_map`]: device-number ranges resolved to live objects.
//!
//! The crate is `no_std` with `alloc`, and host-testable.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod bus;
pub mod dd;
pub mod deferred;
pub mod device;
pub mod devres;
pub mod driver;
pub mod error;
pub mod klist;
pub mod kobj_map;
pub mod links;

pub use bus::{Bus, BusConfig, BusEvent, BusFlags, BusNotifier, BusOps, DefaultBusOps};
pub use dd::{BindOutcome, wait_for_quiescence};
pub use device::{BindState, Device, DeviceGuard};
pub use devres::{ActionId, AllocFlags, GroupId, Releasable};
pub use driver::{Driver, DriverOps};
pub use error::{DevresError, DriverError, KobjMapError};
pub use kobj_map::{DevT, KobjMap, Module, Resolver};
pub use links::{LinkTable, NoLinks, ObjectLinks};
