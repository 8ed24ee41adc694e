//! Error taxonomy for script steps.
//!
//! Every backend maps its failures into [`SandboxError`] so the step engine
//! can apply the continuation policy without knowing which backend ran the
//! guest. [`StepError`] is what leaves the step when a failure is fatal: it
//! attaches the step identity and, where one exists, the record index.

use std::fmt;
use std::time::Duration;

use nebula_core::NodeId;

use crate::backend::BackendKind;

/// Failure of a single script invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// Guest code threw, failed to parse, or hit an interpreter limit.
    #[error("{message}{}", line_suffix(.line))]
    GuestExecution {
        /// Message reported by the guest or the interpreter.
        message: String,
        /// 1-based line in the guest source, when it could be determined.
        line: Option<u32>,
    },

    /// The guest returned a value that does not normalize into records.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The backend did not answer within its deadline.
    #[error("{backend} backend timed out after {timeout:?}")]
    BackendTimeout {
        /// Backend that timed out.
        backend: BackendKind,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The backend could not be reached or dropped the connection.
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        /// Backend that was unreachable.
        backend: BackendKind,
        /// What went wrong.
        reason: String,
    },

    /// Invalid step or sandbox configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The workflow was cancelled while the invocation was in flight.
    #[error("execution cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Convenience constructor for [`SandboxError::GuestExecution`].
    pub fn guest(message: impl Into<String>, line: Option<u32>) -> Self {
        Self::GuestExecution {
            message: message.into(),
            line,
        }
    }

    /// Convenience constructor for [`SandboxError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Convenience constructor for [`SandboxError::BackendUnavailable`].
    pub fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`SandboxError::BackendTimeout`].
    pub fn timeout(backend: BackendKind, timeout: Duration) -> Self {
        Self::BackendTimeout { backend, timeout }
    }

    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GuestExecution { .. } => ErrorKind::GuestExecution,
            Self::Validation(_) => ErrorKind::Validation,
            Self::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Guest source line, for guest execution errors that carry one.
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::GuestExecution { line, .. } => *line,
            _ => None,
        }
    }

    /// Returns `true` if continue-on-fail may convert this error into an
    /// error record. Cancellation always terminates the step.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

fn line_suffix(line: &Option<u32>) -> String {
    line.map(|line| format!(" [line {line}]"))
        .unwrap_or_default()
}

/// Classification of [`SandboxError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SandboxError::GuestExecution`].
    GuestExecution,
    /// See [`SandboxError::Validation`].
    Validation,
    /// See [`SandboxError::BackendTimeout`].
    BackendTimeout,
    /// See [`SandboxError::BackendUnavailable`].
    BackendUnavailable,
    /// See [`SandboxError::Configuration`].
    Configuration,
    /// See [`SandboxError::Cancelled`].
    Cancelled,
}

impl ErrorKind {
    /// Stable name used in logs and on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuestExecution => "GuestExecutionError",
            Self::Validation => "ValidationError",
            Self::BackendTimeout => "BackendTimeoutError",
            Self::BackendUnavailable => "BackendUnavailableError",
            Self::Configuration => "ConfigurationError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a guest return value could not be normalized into records.
///
/// Messages name the offending key or record so the author can fix the
/// script without reading host logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// "Run once for all items" code returned something other than an array.
    #[error("code doesn't return items properly: expected an array of objects, got {found}")]
    NotAnArray {
        /// Description of what was returned instead.
        found: &'static str,
    },

    /// An element of the returned array is not an object.
    #[error("item {index} returned by the code is not an object (got {found})")]
    ElementNotObject {
        /// Position in the returned array.
        index: usize,
        /// Description of the element.
        found: &'static str,
    },

    /// "Run once for each item" code returned something other than an object.
    #[error("code doesn't return an object for item {item_index} (got {found})")]
    NotAnObject {
        /// Input record the invocation ran for.
        item_index: usize,
        /// Description of what was returned instead.
        found: &'static str,
    },

    /// "Run once for each item" code returned an array.
    #[error(
        "code returned an array for item {item_index}, but 'Run once for each item' mode expects \
         a single object; switch the mode to 'Run once for all items' to return multiple items"
    )]
    ArrayInPerItemMode {
        /// Input record the invocation ran for.
        item_index: usize,
    },

    /// A record carries a top-level key outside the allow-list.
    #[error(
        "unknown top-level item key `{key}` in item {item_index}; allowed keys are {}",
        ALLOWED_KEYS_LIST
    )]
    UnknownKey {
        /// The offending key.
        key: String,
        /// Record the key was found in.
        item_index: usize,
    },

    /// A record has no `data` key.
    #[error("item {item_index} is missing the required `data` key")]
    MissingData {
        /// Record without data.
        item_index: usize,
    },

    /// A known key carries a value of the wrong shape.
    #[error("invalid `{key}` in item {item_index}: {reason}")]
    InvalidField {
        /// Key with the invalid value.
        key: &'static str,
        /// Record the key was found in.
        item_index: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The return value could not be serialized across the sandbox boundary.
    #[error("code returned a value that cannot be serialized: {reason}")]
    Unserializable {
        /// Serializer message.
        reason: String,
    },

    /// Validation failed inside an external worker.
    #[error("{0}")]
    Reported(String),
}

const ALLOWED_KEYS_LIST: &str = "data, attachments, lineage, errorInfo, legacyIndex";

impl ValidationError {
    /// Index of the record the error refers to, if any.
    pub fn item_index(&self) -> Option<usize> {
        match self {
            Self::ElementNotObject { index, .. } => Some(*index),
            Self::NotAnObject { item_index, .. }
            | Self::ArrayInPerItemMode { item_index }
            | Self::UnknownKey { item_index, .. }
            | Self::MissingData { item_index }
            | Self::InvalidField { item_index, .. } => Some(*item_index),
            Self::NotAnArray { .. } | Self::Unserializable { .. } | Self::Reported(_) => None,
        }
    }
}

/// Fatal failure of a script step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("step `{step_name}` failed{}: {source}", item_suffix(.item_index))]
pub struct StepError {
    /// Identity of the failing step.
    pub step_id: NodeId,
    /// Display name of the failing step.
    pub step_name: String,
    /// Input record being processed, where available.
    pub item_index: Option<usize>,
    /// Underlying invocation failure.
    pub source: SandboxError,
}

impl StepError {
    /// Classification of the underlying failure.
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    /// Guest source line of the underlying failure, if known.
    pub fn line(&self) -> Option<u32> {
        self.source.line()
    }
}

fn item_suffix(item_index: &Option<usize>) -> String {
    item_index
        .map(|index| format!(" on item {index}"))
        .unwrap_or_default()
}
