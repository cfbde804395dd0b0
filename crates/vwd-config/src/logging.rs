//! Structured logging utilities for vworkdir components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use vwd_config::logging::*;
//!
//! log_queue_info!("Worker started", replayed = 3);
//! log_store_debug!("Compaction complete", entries = 120);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const JOURNAL: &'static str = "JOURNAL";
    pub const STORE: &'static str = "STORE";
    pub const LOCK: &'static str = "LOCK";
    pub const QUEUE: &'static str = "QUEUE";
    pub const IPC: &'static str = "IPC";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "STORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STORE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORE", $($key = $value,)* $msg)
    };
}

// === QUEUE logging macros ===

#[macro_export]
macro_rules! log_queue_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_queue_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_queue_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "QUEUE", $($key = $value,)* $msg)
    };
}

// === LOCK logging macros ===

#[macro_export]
macro_rules! log_lock_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "LOCK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_lock_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "LOCK", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::JOURNAL, "JOURNAL");
        assert_eq!(Component::QUEUE, "QUEUE");
        assert_eq!(Component::LOCK, "LOCK");
    }
}
