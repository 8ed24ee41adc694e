//! Configuration presets for common scenarios

use super::{Config, DisplayConfig, Fields, Format};

impl Config {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Reads `NEBULA_LOG` (falling back to `RUST_LOG`), `NEBULA_LOG_FORMAT`,
    /// `NEBULA_LOG_SOURCE`, `NEBULA_SERVICE`, `NEBULA_ENV` and
    /// `NEBULA_VERSION`. Unknown formats keep the compact default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("NEBULA_LOG").or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }

        if let Some(format) = lookup("NEBULA_LOG_FORMAT") {
            config.format = format.parse().unwrap_or(Format::Compact);
        }

        if let Some(source) = lookup("NEBULA_LOG_SOURCE") {
            config.display.source = matches!(source.as_str(), "1" | "true" | "yes");
        }

        config.fields = Fields {
            service: lookup("NEBULA_SERVICE"),
            env: lookup("NEBULA_ENV"),
            version: lookup("NEBULA_VERSION"),
        };

        config
    }

    /// Development configuration (pretty, debug level).
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            display: DisplayConfig {
                colors: true,
                source: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Production configuration (JSON, info level).
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            display: DisplayConfig {
                colors: false,
                source: false,
                flatten: true,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }

    /// Test configuration (trace level, no colors).
    #[must_use]
    pub fn test() -> Self {
        Self {
            level: "trace".to_string(),
            format: Format::Compact,
            display: DisplayConfig {
                colors: false,
                ..DisplayConfig::default()
            },
            ..Self::default()
        }
    }
}
