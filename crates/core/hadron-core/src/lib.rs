//! Core synchronization primitives and logging for the Hadron driver core.
//!
//! This crate contains the host-testable building blocks the driver core is
//! written against: spin locks (plain and interrupt-safe), a condition
//! variable for blocking waits, and the leveled kernel logging macros.
//!
//! By living outside the driver crate, these types can be tested with
//! `cargo test` and loom on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod log;
pub mod sync;
