//! Sandbox configuration.
//!
//! Loaded once per host process, from TOML or `NEBULA_SANDBOX_*`
//! environment variables. Every field has a default, so an empty document
//! yields a working in-process setup with no modules and no HTTP helper.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Wildcard accepted in module allow-lists.
pub const ANY_MODULE: &str = "*";

/// Top-level sandbox settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Dispatch JavaScript to the external worker instead of in-process.
    pub use_external_worker: bool,
    /// External worker connection settings.
    pub worker: Option<WorkerConfig>,
    /// Which modules guest code may `require`.
    pub modules: ModulePolicy,
    /// Which host helpers are exposed to guests.
    pub helpers: HelperConfig,
    /// In-process interpreter limits.
    pub limits: InterpreterLimits,
    /// Wall-clock limit for one in-process invocation, in milliseconds.
    pub execution_timeout_ms: u64,
    /// Maximum concurrent invocations in "Run once for each item" mode.
    pub max_concurrency: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            use_external_worker: false,
            worker: None,
            modules: ModulePolicy::default(),
            helpers: HelperConfig::default(),
            limits: InterpreterLimits::default(),
            execution_timeout_ms: 60_000,
            max_concurrency: 8,
        }
    }
}

impl SandboxConfig {
    /// Wall-clock limit for one in-process invocation.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, SandboxError> {
        let config: Self = toml::from_str(source)
            .map_err(|e| SandboxError::configuration(format!("invalid sandbox config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `NEBULA_SANDBOX_*` variables from the process environment.
    pub fn from_env() -> Result<Self, SandboxError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults; malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SandboxError> {
        let mut config = Self::default();

        if let Some(value) = lookup("NEBULA_SANDBOX_USE_EXTERNAL_WORKER") {
            config.use_external_worker = parse_flag("NEBULA_SANDBOX_USE_EXTERNAL_WORKER", &value)?;
        }
        if let Some(address) = lookup("NEBULA_SANDBOX_WORKER_ADDRESS") {
            let mut worker = WorkerConfig::new(address);
            if let Some(value) = lookup("NEBULA_SANDBOX_WORKER_TIMEOUT_MS") {
                worker.request_timeout_ms = parse_number("NEBULA_SANDBOX_WORKER_TIMEOUT_MS", &value)?;
            }
            if let Some(value) = lookup("NEBULA_SANDBOX_WORKER_CONNECT_TIMEOUT_MS") {
                worker.connect_timeout_ms =
                    parse_number("NEBULA_SANDBOX_WORKER_CONNECT_TIMEOUT_MS", &value)?;
            }
            if let Some(value) = lookup("NEBULA_SANDBOX_WORKER_MAX_FRAME_BYTES") {
                worker.max_frame_bytes = parse_number("NEBULA_SANDBOX_WORKER_MAX_FRAME_BYTES", &value)?;
            }
            config.worker = Some(worker);
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_BUILTIN_MODULES") {
            config.modules.builtin = parse_list(&value);
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_EXTERNAL_MODULES") {
            config.modules.external = parse_list(&value);
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_ALLOW_TRANSITIVE") {
            config.modules.allow_transitive = parse_flag("NEBULA_SANDBOX_ALLOW_TRANSITIVE", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_HTTP_HELPER") {
            config.helpers.http = parse_flag("NEBULA_SANDBOX_HTTP_HELPER", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_BINARY_HELPER") {
            config.helpers.binary = parse_flag("NEBULA_SANDBOX_BINARY_HELPER", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_ENCODING_HELPER") {
            config.helpers.encoding = parse_flag("NEBULA_SANDBOX_ENCODING_HELPER", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_MAX_SOURCE_BYTES") {
            config.limits.max_source_bytes = parse_number("NEBULA_SANDBOX_MAX_SOURCE_BYTES", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_LOOP_LIMIT") {
            config.limits.loop_iteration_limit = parse_number("NEBULA_SANDBOX_LOOP_LIMIT", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_RECURSION_LIMIT") {
            config.limits.recursion_limit = parse_number("NEBULA_SANDBOX_RECURSION_LIMIT", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_TIMEOUT_MS") {
            config.execution_timeout_ms = parse_number("NEBULA_SANDBOX_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("NEBULA_SANDBOX_CONCURRENCY") {
            config.max_concurrency = parse_number("NEBULA_SANDBOX_CONCURRENCY", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that cannot work.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.max_concurrency == 0 {
            return Err(SandboxError::configuration(
                "max_concurrency must be at least 1",
            ));
        }
        if self.execution_timeout_ms == 0 {
            return Err(SandboxError::configuration(
                "execution_timeout_ms must be greater than zero",
            ));
        }
        if self.use_external_worker && self.worker.is_none() {
            return Err(SandboxError::configuration(
                "use_external_worker is set but no worker address is configured",
            ));
        }
        if let Some(worker) = &self.worker {
            if worker.address.trim().is_empty() {
                return Err(SandboxError::configuration("worker address is empty"));
            }
            if worker.request_timeout_ms == 0 {
                return Err(SandboxError::configuration(
                    "worker request_timeout_ms must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

/// External worker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// `host:port` of the worker.
    pub address: String,
    /// Connect deadline, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-request deadline, in milliseconds.
    pub request_timeout_ms: u64,
    /// Largest accepted frame, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl WorkerConfig {
    /// Settings for a worker at `address` with default deadlines.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Module allow-lists. Empty lists allow nothing; `"*"` allows everything
/// of that kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulePolicy {
    /// Allowed built-in modules.
    pub builtin: Vec<String>,
    /// Allowed external modules.
    pub external: Vec<String>,
    /// Whether allowed external modules may load their own dependencies.
    pub allow_transitive: bool,
}

impl ModulePolicy {
    /// Returns `true` if the built-in module `name` is allowed.
    pub fn allows_builtin(&self, name: &str) -> bool {
        list_allows(&self.builtin, name)
    }

    /// Returns `true` if the external module `name` is allowed.
    pub fn allows_external(&self, name: &str) -> bool {
        list_allows(&self.external, name)
    }
}

fn list_allows(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry == ANY_MODULE || entry == name)
}

/// Host helper switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Outbound HTTP through the host proxy.
    pub http: bool,
    /// Materializing binary attachments.
    pub binary: bool,
    /// Base64 encode and decode.
    pub encoding: bool,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            http: false,
            binary: true,
            encoding: true,
        }
    }
}

/// Resource limits for the in-process interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterLimits {
    /// Largest accepted guest source, in bytes.
    pub max_source_bytes: usize,
    /// Iterations any single loop may run.
    pub loop_iteration_limit: u64,
    /// Maximum call depth.
    pub recursion_limit: usize,
}

impl Default for InterpreterLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 1024 * 1024,
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
        }
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SandboxError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(SandboxError::configuration(format!(
            "{key}: expected a boolean, got `{other}`"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SandboxError> {
    value
        .trim()
        .parse()
        .map_err(|_| SandboxError::configuration(format!("{key}: expected a number, got `{value}`")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SandboxConfig::from_toml_str("").unwrap();
        assert_eq!(config, SandboxConfig::default());
        assert!(!config.helpers.http);
        assert_eq!(config.execution_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn toml_with_worker_and_modules() {
        let config = SandboxConfig::from_toml_str(
            r#"
            use_external_worker = true
            max_concurrency = 2

            [worker]
            address = "127.0.0.1:5679"
            request_timeout_ms = 250

            [modules]
            builtin = ["util"]
            external = ["*"]
            allow_transitive = true
            "#,
        )
        .unwrap();

        let worker = config.worker.as_ref().unwrap();
        assert_eq!(worker.address, "127.0.0.1:5679");
        assert_eq!(worker.request_timeout(), Duration::from_millis(250));
        assert_eq!(worker.connect_timeout_ms, 5_000);
        assert!(config.modules.allows_builtin("util"));
        assert!(!config.modules.allows_builtin("crypto"));
        assert!(config.modules.allows_external("lodash"));
    }

    #[test]
    fn external_worker_without_address_is_rejected() {
        let err = SandboxConfig::from_toml_str("use_external_worker = true").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = SandboxConfig::from_toml_str("max_concurrency = 0").unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let config = SandboxConfig::from_lookup(lookup(&[
            ("NEBULA_SANDBOX_USE_EXTERNAL_WORKER", "true"),
            ("NEBULA_SANDBOX_WORKER_ADDRESS", "worker:5679"),
            ("NEBULA_SANDBOX_WORKER_TIMEOUT_MS", "1500"),
            ("NEBULA_SANDBOX_BUILTIN_MODULES", "util, path"),
            ("NEBULA_SANDBOX_HTTP_HELPER", "on"),
            ("NEBULA_SANDBOX_CONCURRENCY", "4"),
        ]))
        .unwrap();

        assert!(config.use_external_worker);
        assert_eq!(config.worker.unwrap().request_timeout_ms, 1500);
        assert_eq!(config.modules.builtin, vec!["util", "path"]);
        assert!(config.helpers.http);
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn env_lookup_covers_limits_and_worker_framing() {
        let config = SandboxConfig::from_lookup(lookup(&[
            ("NEBULA_SANDBOX_WORKER_ADDRESS", "worker:5679"),
            ("NEBULA_SANDBOX_WORKER_CONNECT_TIMEOUT_MS", "750"),
            ("NEBULA_SANDBOX_WORKER_MAX_FRAME_BYTES", "4096"),
            ("NEBULA_SANDBOX_ENCODING_HELPER", "off"),
            ("NEBULA_SANDBOX_MAX_SOURCE_BYTES", "2048"),
            ("NEBULA_SANDBOX_LOOP_LIMIT", "500"),
            ("NEBULA_SANDBOX_RECURSION_LIMIT", "64"),
        ]))
        .unwrap();

        let worker = config.worker.unwrap();
        assert_eq!(worker.connect_timeout_ms, 750);
        assert_eq!(worker.max_frame_bytes, 4096);
        assert!(!config.helpers.encoding);
        assert_eq!(
            config.limits,
            InterpreterLimits {
                max_source_bytes: 2048,
                loop_iteration_limit: 500,
                recursion_limit: 64,
            }
        );
    }

    #[rstest]
    #[case("NEBULA_SANDBOX_CONCURRENCY", "many")]
    #[case("NEBULA_SANDBOX_LOOP_LIMIT", "forever")]
    #[case("NEBULA_SANDBOX_ENCODING_HELPER", "sometimes")]
    #[case("NEBULA_SANDBOX_TIMEOUT_MS", "-1")]
    #[case("NEBULA_SANDBOX_HTTP_HELPER", "maybe")]
    fn malformed_env_values_are_rejected(#[case] key: &str, #[case] value: &str) {
        let err = SandboxConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains(key));
    }

    #[test]
    fn wildcard_allows_any_module() {
        let policy = ModulePolicy {
            builtin: vec![ANY_MODULE.into()],
            ..ModulePolicy::default()
        };
        assert!(policy.allows_builtin("anything"));
        assert!(!policy.allows_external("anything"));
    }
}
