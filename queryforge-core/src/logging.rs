// logging.rs - Minimal leveled logging for the compiler
// No logger framework: a global atomic level and stderr output

use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable consulted by [`init_from_env`]
pub const LOG_ENV_VAR: &str = "QUERYFORGE_LOG";

/// Log levels (ordered by verbosity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Nothing is written
    Off = 0,
    /// Failures surfaced to the caller
    Error = 1,
    /// Suspicious but accepted input
    Warn = 2,
    /// One line per compiled pipeline
    Info = 3,
    /// Stage level decisions (narrowing, access bumps)
    Debug = 4,
    /// Index entry and post-check internals
    Trace = 5,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<LogLevel> {
        match s.trim().to_uppercase().as_str() {
            "OFF" | "NONE" => Some(LogLevel::Off),
            "ERROR" => Some(LogLevel::Error),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "TRACE" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "OFF",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(level: u8) -> LogLevel {
        match level {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

// Global log level (default: WARN)
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> LogLevel {
    LogLevel::from_u8(GLOBAL_LOG_LEVEL.load(Ordering::Relaxed))
}

/// Apply the level named by `QUERYFORGE_LOG`, if set and valid.
/// Returns the level now in effect.
pub fn init_from_env() -> LogLevel {
    if let Some(level) = std::env::var(LOG_ENV_VAR)
        .ok()
        .and_then(|value| LogLevel::from_str(&value))
    {
        set_log_level(level);
    }
    get_log_level()
}

#[inline]
pub fn should_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= get_log_level()
}

#[doc(hidden)]
pub fn log_message(level: LogLevel, module: &str, message: &str) {
    if should_log(level) {
        eprintln!(
            "{} [{}] {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level.as_str(),
            module,
            message
        );
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::logging::should_log($crate::logging::LogLevel::Debug) {
            $crate::logging::log_message(
                $crate::logging::LogLevel::Debug,
                module_path!(),
                &format!($($arg)*)
            )
        }
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        if $crate::logging::should_log($crate::logging::LogLevel::Trace) {
            $crate::logging::log_message(
                $crate::logging::LogLevel::Trace,
                module_path!(),
                &format!($($arg)*)
            )
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Off < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str(" warning "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("TrAcE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("loud"), None);
    }

    #[test]
    fn test_level_filtering_and_off() {
        set_log_level(LogLevel::Info);
        assert!(should_log(LogLevel::Error));
        assert!(should_log(LogLevel::Info));
        assert!(!should_log(LogLevel::Debug));
        assert!(!should_log(LogLevel::Off));

        set_log_level(LogLevel::Off);
        assert!(!should_log(LogLevel::Error));
        set_log_level(LogLevel::Warn);
    }
}
