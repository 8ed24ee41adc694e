//! Script units: the guest source plus how it should be run.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Language the guest source is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuestLanguage {
    /// ECMAScript, runnable in-process or on a worker.
    JavaScript,
    /// Python, runnable only on an external worker.
    Python,
}

impl fmt::Display for GuestLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JavaScript => f.write_str("javaScript"),
            Self::Python => f.write_str("python"),
        }
    }
}

/// How the guest is invoked over the input records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionMode {
    /// One invocation sees every input record and returns a list.
    #[default]
    AllItems,
    /// One invocation per input record, each returning a single record.
    PerItem,
}

/// Guest source together with its language and execution mode.
///
/// Cloning is cheap: the source is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptUnit {
    source: Arc<str>,
    language: GuestLanguage,
    mode: ExecutionMode,
}

impl ScriptUnit {
    /// Creates a unit from source text.
    pub fn new(source: impl Into<Arc<str>>, language: GuestLanguage, mode: ExecutionMode) -> Self {
        Self {
            source: source.into(),
            language,
            mode,
        }
    }

    /// JavaScript unit, the common case.
    pub fn javascript(source: impl Into<Arc<str>>, mode: ExecutionMode) -> Self {
        Self::new(source, GuestLanguage::JavaScript, mode)
    }

    /// Guest source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Guest language.
    pub fn language(&self) -> GuestLanguage {
        self.language
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_names_are_camel_case() {
        let unit = ScriptUnit::javascript("return []", ExecutionMode::PerItem);
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "source": "return []",
                "language": "javaScript",
                "mode": "perItem",
            })
        );
    }

    #[test]
    fn default_mode_is_all_items() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::AllItems);
    }
}
