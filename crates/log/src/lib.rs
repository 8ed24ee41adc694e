//! # Nebula Log
//!
//! Subscriber setup shared by Nebula binaries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! fn main() -> Result<(), nebula_log::LogError> {
//!     let _guard = nebula_log::auto_init()?;
//!     tracing::info!(port = 8080, "worker starting");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Fields, Format, Writer};
pub use error::{LogError, LogResult};

/// Auto-detect and initialize the best logging configuration.
///
/// `NEBULA_LOG` / `RUST_LOG` in the environment win; otherwise debug
/// builds get [`Config::development`] and release builds
/// [`Config::production`].
pub fn auto_init() -> LogResult<LoggerGuard> {
    if std::env::var("NEBULA_LOG").is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with the default configuration.
pub fn init() -> LogResult<LoggerGuard> {
    init_with(Config::default())
}

/// Initialize with a custom configuration.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}
