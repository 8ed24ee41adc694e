//! Subscriber installation.

mod format;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Writer};
use crate::error::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard that keeps the logger alive.
///
/// Holds the root span carrying the configured global fields; dropping
/// the guard exits that span.
#[derive(Debug)]
pub struct LoggerGuard {
    _root_span: Option<tracing::span::EnteredSpan>,
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and install the global subscriber.
    ///
    /// Fails when the filter cannot be parsed or another subscriber is
    /// already installed.
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = EnvFilter::try_new(&self.config.level).map_err(|e| LogError::Filter {
            filter: self.config.level.clone(),
            reason: e.to_string(),
        })?;

        let writer = match self.config.writer {
            Writer::Stderr => BoxMakeWriter::new(std::io::stderr),
            Writer::Stdout => BoxMakeWriter::new(std::io::stdout),
        };

        Registry::default()
            .with(format::layer(self.config.format, &self.config.display, writer))
            .with(filter)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        let root_span = (!self.config.fields.is_empty()).then(|| {
            let fields = &self.config.fields;
            tracing::info_span!(
                "app",
                service = fields.service.as_deref().unwrap_or(""),
                env = fields.env.as_deref().unwrap_or(""),
                version = fields.version.as_deref().unwrap_or("")
            )
            .entered()
        });

        Ok(LoggerGuard {
            _root_span: root_span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_rejected_before_install() {
        let config = Config {
            level: "nebula=verbose".to_string(),
            ..Config::test()
        };
        let err = LoggerBuilder::from_config(config).build().unwrap_err();
        assert!(matches!(err, LogError::Filter { .. }));
    }
}
