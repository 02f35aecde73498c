//! Logging interface for the Hadron driver core.
//!
//! Provides [`klog!`] and the leveled convenience macros (`kinfo!`,
//! `kdebug!`, etc.). Records are forwarded to the [`log`](::log) facade, so
//! the embedding kernel decides where they end up by installing a logger.
//! Before a logger is installed, output is silently discarded.
//!
//! Also provides [`kbug!`] and [`kwarn_on!`] for reporting programmer misuse:
//! the condition is logged first and then asserted.

use core::fmt;

/// Severity of a driver-core log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// A broken invariant; the caller is about to panic.
    Fatal = 0,
    /// An operation failed; the core keeps going.
    Error = 1,
    /// Odd but survivable, such as a probe that failed.
    Warn = 2,
    /// Bind and unbind events.
    Info = 3,
    /// Per-driver match and probe decisions.
    Debug = 4,
    /// Every resource and list operation.
    Trace = 5,
}

impl LogLevel {
    /// Five-character tag, padded so columns line up.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Maps this level onto the [`log`](::log) facade's levels.
    ///
    /// `Fatal` has no facade counterpart and is reported as `Error`.
    pub const fn facade_level(self) -> ::log::Level {
        match self {
            Self::Fatal | Self::Error => ::log::Level::Error,
            Self::Warn => ::log::Level::Warn,
            Self::Info => ::log::Level::Info,
            Self::Debug => ::log::Level::Debug,
            Self::Trace => ::log::Level::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().trim_end())
    }
}

/// Backend of [`klog!`]; call the macros instead.
#[doc(hidden)]
pub fn _log(level: LogLevel, target: &str, args: fmt::Arguments<'_>) {
    ::log::log!(target: target, level.facade_level(), "{}", args);
}

/// Emits a record at `level`, targeted at the calling module.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, ::core::module_path!(), format_args!($($arg)*))
    };
}

/// [`klog!`] at [`LogLevel::Fatal`].
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// [`klog!`] at [`LogLevel::Error`].
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// [`klog!`] at [`LogLevel::Warn`].
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// [`klog!`] at [`LogLevel::Info`].
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// [`klog!`] at [`LogLevel::Debug`].
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// [`klog!`] at [`LogLevel::Trace`].
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}

// Misuse reporting.

/// Reports a broken invariant and aborts.
///
/// Used for programmer misuse that would corrupt shared state if execution
/// continued (double release, recursive unbind).
#[macro_export]
macro_rules! kbug {
    ($($arg:tt)*) => {{
        $crate::kfatal!($($arg)*);
        ::core::panic!($($arg)*)
    }};
}

/// Logs a warning when `cond` holds and evaluates to `cond`.
///
/// The condition is asserted in debug builds and under `cfg(hadron_hardened)`,
/// so misuse is caught by tests while release kernels keep running.
#[macro_export]
macro_rules! kwarn_on {
    ($cond:expr, $($arg:tt)*) => {{
        let hit: bool = $cond;
        if hit {
            $crate::kerr!($($arg)*);
            #[cfg(any(debug_assertions, hadron_hardened))]
            ::core::panic!($($arg)*);
        }
        hit
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Fatal < LogLevel::Error);
        assert!(LogLevel::Warn < LogLevel::Trace);
    }

    #[test]
    fn level_names_are_fixed_width() {
        for level in [
            LogLevel::Fatal,
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(level.name().len(), 5);
        }
        assert_eq!(format!("{}", LogLevel::Warn), "WARN");
    }

    #[test]
    fn fatal_maps_to_error() {
        assert_eq!(LogLevel::Fatal.facade_level(), ::log::Level::Error);
        assert_eq!(LogLevel::Debug.facade_level(), ::log::Level::Debug);
    }

    #[test]
    fn macros_without_logger_are_silent() {
        kinfo!("probe {} ok", "uart0");
        kdebug!("nothing installed");
    }

    #[test]
    fn records_reach_installed_logger() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(::log::LevelFilter::Trace)
            .try_init();
        assert!(::log::log_enabled!(::log::Level::Trace));
        ktrace!("bus {}: probing", "pci");
        kerr!("driver {} failed", "nvme");
    }

    #[test]
    fn kwarn_on_false_is_quiet() {
        assert!(!kwarn_on!(1 + 1 == 3, "arithmetic broke"));
    }

    #[test]
    #[should_panic(expected = "group 7 not open")]
    fn kwarn_on_true_asserts_in_debug() {
        kwarn_on!(true, "group {} not open", 7);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn kbug_panics() {
        kbug!("double release of {}", "res");
    }
}
