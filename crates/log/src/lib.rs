//! # keyshift-log
//!
//! One-call `tracing` setup for the keyshift binaries and test suites.
//!
//! ```rust,no_run
//! fn main() -> Result<(), keyshift_log::LogError> {
//!     let _guard = keyshift_log::auto_init()?;
//!     tracing::info!(config_id = "orders-db", "rotation scheduled");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Fields, Format};
pub use error::{LogError, LogResult};

/// Auto-detect and initialize the best logging configuration
///
/// Environment variables win; otherwise debug builds get the development
/// preset and release builds the production preset.
pub fn auto_init() -> LogResult<LoggerGuard> {
    if std::env::var("KEYSHIFT_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with default configuration
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests; a no-op when a subscriber is already installed
pub fn init_test() -> LoggerGuard {
    if tracing::dispatcher::has_been_set() {
        return LoggerGuard::noop();
    }
    LoggerBuilder::from_config(Config::test())
        .with_test_writer()
        .build()
        .unwrap_or_else(|_| LoggerGuard::noop())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_reported() {
        let result = init_with(Config::default().with_level("keyshift=loudest"));
        assert!(matches!(result, Err(LogError::Filter { .. })));
    }

    #[test]
    fn test_init_test_is_idempotent() {
        let _first = init_test();
        let _second = init_test();
        assert!(tracing::dispatcher::has_been_set());
    }
}
