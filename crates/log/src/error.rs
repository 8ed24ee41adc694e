//! Logger error types.

/// Result type for logger operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while setting up logging.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LogError {
    /// The level filter could not be parsed.
    #[error("invalid filter `{filter}`: {reason}")]
    Filter {
        /// Filter directive as configured.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber was already installed.
    #[error("logger already initialized: {0}")]
    AlreadyInitialized(String),
}
