//! Structured logging utilities for vmsnap components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use vmsnap_config::log_loader_info;
//!
//! log_loader_info!("Snapshot cached", chunks = 3);
//! ```

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const LOADER: &'static str = "LOADER";
    pub const CLI: &'static str = "CLI";
}

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "VMSNAP_LOG";

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === LOADER logging macros ===

#[macro_export]
macro_rules! log_loader_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = $crate::logging::Component::LOADER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_loader_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::LOADER, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_loader_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::LOADER, $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = $crate::logging::Component::CLI, $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = $crate::logging::Component::CLI, $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
///
/// `VMSNAP_LOG` takes precedence over `RUST_LOG`; `level` applies when
/// neither is set. Calling this again after a subscriber is installed is a
/// no-op.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::LOADER, "LOADER");
        assert_eq!(Component::CLI, "CLI");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_macros_expand() {
        log_loader_info!("loader message", chunks = 3);
        log_loader_warn!("loader warning", file = "scratchfs");
        log_cli_debug!("cli message");
        init_logging(LogLevel::Warn);
        init_logging(LogLevel::Warn);
    }
}
