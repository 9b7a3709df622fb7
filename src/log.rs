//! Central logging sink.
//!
//! Messages flow through two independently gated sinks: stderr (forwarded to
//! the `tracing` macros so embedders can install their own subscriber) and an
//! optional user callback installed with [`set_callback`]. The sink
//! configuration lives outside the global runtime state so that logging from
//! any code path never has to re-enter the main lock.

use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogLevel {
    Disable = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Disable => "disable",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

struct Sinks {
    stderr_level: LogLevel,
    callback_level: LogLevel,
    callback: Option<LogCallback>,
}

static SINKS: Lazy<RwLock<Sinks>> = Lazy::new(|| {
    RwLock::new(Sinks {
        stderr_level: LogLevel::Warn,
        callback_level: LogLevel::Disable,
        callback: None,
    })
});

pub fn set_stderr_level(level: LogLevel) {
    SINKS.write().stderr_level = level;
}

pub fn set_callback(level: LogLevel, callback: Option<LogCallback>) {
    let mut sinks = SINKS.write();
    sinks.callback_level = if callback.is_some() {
        level
    } else {
        LogLevel::Disable
    };
    sinks.callback = callback;
}

/// Highest level any sink currently accepts. Callers use this to skip
/// expensive message formatting.
pub fn max_level() -> LogLevel {
    let sinks = SINKS.read();
    sinks.stderr_level.max(sinks.callback_level)
}

pub fn enabled(level: LogLevel) -> bool {
    level <= max_level()
}

pub fn write(level: LogLevel, msg: &str) {
    let sinks = SINKS.read();
    if level <= sinks.stderr_level {
        match level {
            LogLevel::Error => tracing::error!(target: "arrayjit", "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "arrayjit", "{msg}"),
            LogLevel::Info => tracing::info!(target: "arrayjit", "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "arrayjit", "{msg}"),
            LogLevel::Trace | LogLevel::Disable => {
                tracing::trace!(target: "arrayjit", "{msg}")
            }
        }
    }
    if level <= sinks.callback_level {
        if let Some(cb) = sinks.callback.as_ref() {
            cb(level, msg);
        }
    }
}

macro_rules! jitlog {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::write($level, &format!($($arg)*));
        }
    };
}

pub(crate) use jitlog;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn callback_sink_respects_level_gate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        // Other tests in this binary may log concurrently; count only the
        // probe messages.
        set_callback(
            LogLevel::Info,
            Some(Box::new(move |_, msg| {
                if msg.starts_with("sink-probe") {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        write(LogLevel::Info, "sink-probe visible");
        write(LogLevel::Debug, "sink-probe gated out");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        set_callback(LogLevel::Disable, None);
        write(LogLevel::Error, "sink-probe no sink");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
