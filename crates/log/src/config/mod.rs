//! Configuration types.

mod presets;

use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Level filter (e.g. `"info"`, `"debug,nebula_sandbox=trace"`).
    pub level: String,
    /// Output format.
    pub format: Format,
    /// Output destination.
    pub writer: Writer,
    /// Display toggles.
    pub display: DisplayConfig,
    /// Global fields attached to a root span.
    pub fields: Fields,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Human-readable, multi-line.
    Pretty,
    /// Single-line.
    Compact,
    /// Structured JSON.
    Json,
}

/// Output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Writer {
    /// Standard error.
    Stderr,
    /// Standard output.
    Stdout,
}

/// Display configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct DisplayConfig {
    /// Show source location (file:line).
    pub source: bool,
    /// Show target module.
    pub target: bool,
    /// Show thread IDs.
    pub thread_ids: bool,
    /// Use ANSI colors.
    pub colors: bool,
    /// Show span list in JSON.
    pub span_list: bool,
    /// Flatten JSON events.
    pub flatten: bool,
}

/// Global fields recorded on the root span.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fields {
    /// Service name.
    pub service: Option<String>,
    /// Environment (dev/staging/prod).
    pub env: Option<String>,
    /// Version.
    pub version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            writer: Writer::Stderr,
            display: DisplayConfig::default(),
            fields: Fields::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            source: false,
            target: true,
            thread_ids: false,
            colors: true,
            span_list: false,
            flatten: false,
        }
    }
}

impl Fields {
    /// Returns `true` when no field is set.
    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.env.is_none() && self.version.is_none()
    }
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}
