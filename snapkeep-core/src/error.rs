/*!
Error types for the snapkeep core engine.
*/

use thiserror::Error;

/// Result type used throughout the snapkeep core.
pub type Result<T> = std::result::Result<T, SnapKeepError>;

/// Errors that can occur while loading, deciding on, or mutating snapshots.
#[derive(Error, Debug)]
pub enum SnapKeepError {
    /// I/O errors during file or subprocess operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A single value or name failed validation. Fatal to one object only.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A property listing was structurally malformed. Aborts the whole pass.
    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A storage command exited unsuccessfully
    #[error("Command '{command}' failed: {reason}")]
    OperationFailure { command: String, reason: String },

    /// The process lock could not be taken
    #[error("Process lock error: {0}")]
    Mutex(#[from] MutexError),

    /// Inheritance was requested where it has no meaning
    #[error("Inheritance error: {0}")]
    Inheritance(String),

    /// A pool root is missing part of the required property schema
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SnapKeepError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new parse error for the given 1-based line number
    pub fn parse<S: Into<String>>(line: usize, reason: S) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// Create a new operation failure
    pub fn operation<C: Into<String>, R: Into<String>>(command: C, reason: R) -> Self {
        Self::OperationFailure {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a new inheritance error
    pub fn inheritance<S: Into<String>>(msg: S) -> Self {
        Self::Inheritance(msg.into())
    }

    /// Create a new schema error
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error must stop the whole run rather than one object
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Parse { .. } | Self::Schema(_) | Self::Config(_) | Self::Io(_) => true,
            Self::Mutex(e) => !matches!(e, MutexError::Busy { .. }),
            Self::Validation(_)
            | Self::OperationFailure { .. }
            | Self::Inheritance(_)
            | Self::Json(_) => false,
        }
    }
}

/// Failures to acquire the cross-process lock.
///
/// An abandoned lock left by a crashed instance is not an error; it is
/// reported on the acquired handle instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutexError {
    /// Another instance holds the lock
    #[error("lock '{name}' is held by another instance")]
    Busy { name: String },

    /// The lock name cannot be used
    #[error("invalid lock name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The platform refused the lock for reasons other than contention
    #[error("lock '{name}' failed: {reason}")]
    Fatal { name: String, reason: String },
}
