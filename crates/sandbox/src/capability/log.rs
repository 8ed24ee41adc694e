//! Guest console output.
//!
//! Guests call `console.log` and friends; the host forwards each call to a
//! [`LogSink`] synchronously, so entries arrive in call order and before
//! the invocation's outcome is reported.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Severity of a guest log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug`.
    Debug,
    /// `console.log` and `console.info`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error`.
    Error,
}

impl LogLevel {
    /// Parses the level names guests emit; anything unknown is `Info`.
    pub fn from_guest(name: &str) -> Self {
        match name {
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// One line of guest console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Rendered message.
    pub message: String,
    /// Input record the invocation ran for, in "Run once for each item".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
}

/// Destination for guest console output.
pub trait LogSink: Send + Sync {
    /// Records one entry. Must not block on the consumer.
    fn log(&self, entry: LogEntry);
}

/// Whether the workflow runs interactively or in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    /// Started from the editor; console output goes to the UI.
    Manual,
    /// Triggered or scheduled; console output goes to the host log.
    #[default]
    Production,
}

/// Streams entries to the editor UI.
#[derive(Debug, Clone)]
pub struct UiLogSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl UiLogSink {
    /// Sink feeding `tx`.
    pub fn new(tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self { tx }
    }
}

impl LogSink for UiLogSink {
    fn log(&self, entry: LogEntry) {
        // A closed UI just means nobody is watching.
        let _ = self.tx.send(entry);
    }
}

/// Writes entries to the host's `tracing` subscriber under the
/// `nebula::guest` target.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    step: String,
}

impl TracingLogSink {
    /// Sink tagging entries with the step name.
    pub fn new(step: impl Into<String>) -> Self {
        Self { step: step.into() }
    }
}

impl LogSink for TracingLogSink {
    fn log(&self, entry: LogEntry) {
        let step = self.step.as_str();
        let item = entry.item_index;
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(target: "nebula::guest", step, item = ?item, "{message}");
            }
            LogLevel::Info => {
                tracing::info!(target: "nebula::guest", step, item = ?item, "{message}");
            }
            LogLevel::Warn => {
                tracing::warn!(target: "nebula::guest", step, item = ?item, "{message}");
            }
            LogLevel::Error => {
                tracing::error!(target: "nebula::guest", step, item = ?item, "{message}");
            }
        }
    }
}

/// Buffers entries in memory.
///
/// External workers use this to ship logs back with the response.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl CollectingLogSink {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything logged so far.
    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl LogSink for CollectingLogSink {
    fn log(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogSink;

impl LogSink for DiscardLogSink {
    fn log(&self, _entry: LogEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            level: LogLevel::Info,
            message: message.into(),
            item_index: None,
        }
    }

    #[test]
    fn ui_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = UiLogSink::new(tx);
        sink.log(entry("one"));
        sink.log(entry("two"));
        assert_eq!(rx.try_recv().unwrap().message, "one");
        assert_eq!(rx.try_recv().unwrap().message, "two");
    }

    #[test]
    fn ui_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        UiLogSink::new(tx).log(entry("nobody listening"));
    }

    #[test]
    fn collecting_sink_drains() {
        let sink = CollectingLogSink::new();
        sink.log(entry("a"));
        assert_eq!(sink.take(), vec![entry("a")]);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn guest_level_names() {
        assert_eq!(LogLevel::from_guest("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::from_guest("log"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_string(), "error");
    }
}
