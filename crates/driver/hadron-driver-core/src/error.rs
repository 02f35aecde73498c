//! Driver core error types.

use core::fmt;

/// Errors that can occur while binding devices to drivers.
///
/// Probe entry points return these; the binding walk decides from the
/// variant whether the failure ends only the current (device, driver)
/// pairing or is passed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The hardware device is absent or did not respond.
    NoDevice,
    /// The device is present but is not one this driver handles.
    NoSuchDevice,
    /// A resource the probe depends on is not available yet; retry later.
    ProbeDefer,
    /// An allocation failed.
    OutOfMemory,
    /// The object is busy or a driver with the same name is registered.
    Busy,
    /// An object with the same name already exists.
    AlreadyExists,
    /// An argument was out of range or inconsistent.
    InvalidArgument,
    /// The requested object was not found.
    NotFound,
    /// An I/O error occurred during a hardware operation.
    Io,
    /// The requested operation is not supported.
    Unsupported,
}

impl DriverError {
    /// Returns `true` for the two codes that mean "this driver does not
    /// handle this device" rather than "the probe broke".
    ///
    /// These are passed through unchanged by probing and are never retried
    /// against the same driver.
    pub const fn is_rejection(self) -> bool {
        matches!(self, Self::NoDevice | Self::NoSuchDevice)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => f.write_str("no such device"),
            Self::NoSuchDevice => f.write_str("no such device or address"),
            Self::ProbeDefer => f.write_str("probe deferred"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::Busy => f.write_str("device or resource busy"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NotFound => f.write_str("not found"),
            Self::Io => f.write_str("I/O error"),
            Self::Unsupported => f.write_str("operation not supported"),
        }
    }
}

/// Errors returned by the managed resource store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevresError {
    /// No record of the requested kind matched.
    NotFound,
    /// The record could not be allocated.
    OutOfMemory,
}

impl fmt::Display for DevresError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("managed resource not found"),
            Self::OutOfMemory => f.write_str("out of memory for managed resource"),
        }
    }
}

impl From<DevresError> for DriverError {
    fn from(err: DevresError) -> Self {
        match err {
            DevresError::NotFound => Self::NotFound,
            DevresError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Errors returned by the number range map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KobjMapError {
    /// The range is empty or runs past the end of the number space.
    InvalidRange,
    /// The range entries could not be allocated.
    OutOfMemory,
}

impl fmt::Display for KobjMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange => f.write_str("invalid number range"),
            Self::OutOfMemory => f.write_str("out of memory for range entry"),
        }
    }
}

impl From<KobjMapError> for DriverError {
    fn from(err: KobjMapError) -> Self {
        match err {
            KobjMapError::InvalidRange => Self::InvalidArgument,
            KobjMapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_driver_errors() {
        assert_eq!(format!("{}", DriverError::NoDevice), "no such device");
        assert_eq!(
            format!("{}", DriverError::NoSuchDevice),
            "no such device or address"
        );
        assert_eq!(format!("{}", DriverError::ProbeDefer), "probe deferred");
        assert_eq!(format!("{}", DriverError::Io), "I/O error");
    }

    #[test]
    fn only_sentinels_are_rejections() {
        assert!(DriverError::NoDevice.is_rejection());
        assert!(DriverError::NoSuchDevice.is_rejection());
        assert!(!DriverError::Io.is_rejection());
        assert!(!DriverError::ProbeDefer.is_rejection());
        assert!(!DriverError::OutOfMemory.is_rejection());
    }

    #[test]
    fn devres_error_converts() {
        assert_eq!(
            DriverError::from(DevresError::OutOfMemory),
            DriverError::OutOfMemory
        );
        assert_eq!(DriverError::from(DevresError::NotFound), DriverError::NotFound);
        assert_eq!(
            format!("{}", DevresError::NotFound),
            "managed resource not found"
        );
    }

    #[test]
    fn kobj_map_error_converts() {
        assert_eq!(
            DriverError::from(KobjMapError::InvalidRange),
            DriverError::InvalidArgument
        );
        assert_eq!(format!("{}", KobjMapError::InvalidRange), "invalid number range");
    }
}
