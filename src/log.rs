//! Process-wide file log at `~/.foreman/foreman.log`.
//!
//! Pool, queue and orchestrator code runs on many tasks at once, so the file
//! is opened once and every line is written under one lock. The macros check
//! the level before formatting, which keeps `flog_trace!` calls on hot paths
//! (git invocations, agent events) free when tracing is off.
//!
//! The level comes from `--debug` / `FOREMAN_DEBUG=1` (DEBUG) or from
//! `FOREMAN_LOG=<level>`, which wins over both.

use std::fs::File;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

static SINK: OnceLock<Mutex<File>> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Level for the given debug switch and `FOREMAN_LOG` value.
fn resolve_level(debug: bool, override_level: Option<&str>) -> LogLevel {
    if let Some(level) = override_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Set the level and truncate the log file. Call once from `main`; before
/// that, messages are dropped.
pub fn init(debug: bool) {
    let debug = debug || env_flag("FOREMAN_DEBUG");
    DEBUG_ENABLED.store(debug, Ordering::SeqCst);
    let override_level = std::env::var("FOREMAN_LOG").ok();
    set_level(resolve_level(debug, override_level.as_deref()));

    let Some(dir) = dirs::home_dir().map(|h| h.join(".foreman")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    if let Ok(file) = File::create(dir.join("foreman.log")) {
        SINK.set(Mutex::new(file)).ok();
    }
}

pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level <= self::level()
}

/// Write one line. Prefer the `flog*` macros.
pub fn write(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let line = format_line(chrono::Local::now().format("%H:%M:%S%.3f"), level, msg);
    let mut file = sink.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = file.write_all(line.as_bytes());
}

fn format_line(timestamp: impl std::fmt::Display, level: LogLevel, msg: &str) -> String {
    format!("[{}] [{}] {}\n", timestamp, level.as_str(), msg)
}

#[doc(hidden)]
#[macro_export]
macro_rules! __flog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::write($level, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => { $crate::__flog_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! flog_error {
    ($($arg:tt)*) => { $crate::__flog_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! flog_warn {
    ($($arg:tt)*) => { $crate::__flog_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Only written in debug mode.
#[macro_export]
macro_rules! flog_debug {
    ($($arg:tt)*) => { $crate::__flog_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Git command lines and agent events; needs `FOREMAN_LOG=trace`.
#[macro_export]
macro_rules! flog_trace {
    ($($arg:tt)*) => { $crate::__flog_at!($crate::log::LogLevel::Trace, $($arg)*) };
}
