//! Leveled stderr log macros for the pool and its workers.
//!
//! Both the master and the forked worker processes write diagnostics to
//! stderr with a level prefix and the originating pid, so interleaved
//! output from a whole pool stays attributable. Workers additionally
//! forward operational messages to the master over the wire (`log=`
//! frames); that path lives in `wproc-runtime`, not here.
//!
//! # Environment Variables
//!
//! - `WPROC_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `WPROC_LOG_FLUSH=1` - flush stderr after each message
//!
//! # Output Format
//!
//! `[LEVEL] [m<pid>] message` for the master, `[LEVEL] [w<pid>] message`
//! for workers (the role tag is set by the worker loop after fork).

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::env_get_bool;

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static ROLE: AtomicU8 = AtomicU8::new(b'm');

/// Initialize logging from environment variables.
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(env_get_bool("WPROC_LOG_FLUSH", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("WPROC_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Tag this process as master (`'m'`) or worker (`'w'`) in log output.
///
/// Survives nothing across exec, so the worker loop re-tags after fork.
pub fn set_role(role: u8) {
    ROLE.store(role, Ordering::Relaxed);
}

/// Internal: leveled print with `[LEVEL] [<role><pid>]` context.
#[doc(hidden)]
pub fn _wlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();

    let role = ROLE.load(Ordering::Relaxed) as char;
    let _ = write!(handle, "{} [{}{}] ", level.prefix(), role, std::process::id());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");

    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log with context
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log with context
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log with context
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log with context
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log with context
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {{
        $crate::wlog::_wlog_impl(
            $crate::wlog::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
