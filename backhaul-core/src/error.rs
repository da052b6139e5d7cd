/*!
Error types for the Backhaul core.
*/

use backhaul_retry::{RetryError, RetryableError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the Backhaul core.
pub type Result<T> = std::result::Result<T, BackhaulError>;

/// Engine failures recognized from restic's output.
///
/// `Display` reproduces the marker text so a classified failure can be
/// surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// `init` against a repository that already exists. Not fatal for `init`.
    AlreadyInitialized,
    /// The backend rejected the session credentials
    TokenExpired,
    /// The repository config object could not be read
    ConfigFileUnreadable,
    /// Another process holds the repository lock
    Locked,
    /// No snapshot matches the requested id
    SnapshotNotFound,
    /// Anything else, carrying the raw engine text
    Generic(String),
}

impl EngineErrorKind {
    pub fn is_token_expired(&self) -> bool {
        matches!(self, EngineErrorKind::TokenExpired)
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorKind::AlreadyInitialized => {
                f.write_str("repository master key and config already initialized")
            }
            EngineErrorKind::TokenExpired => f.write_str("The provided token has expired"),
            EngineErrorKind::ConfigFileUnreadable => {
                f.write_str("unable to open config file: Stat: 400 Bad Request")
            }
            EngineErrorKind::Locked => f.write_str("repository is already locked by"),
            EngineErrorKind::SnapshotNotFound => {
                f.write_str("failed to find snapshot: no matching ID found for prefix")
            }
            EngineErrorKind::Generic(raw) => f.write_str(raw),
        }
    }
}

/// Errors that can occur during backup and restore.
#[derive(Error, Debug)]
pub enum BackhaulError {
    /// Bad input detected before any engine work
    #[error("Validation error: {0}")]
    Validation(String),

    /// Classified engine failure
    #[error("Engine error: {0}")]
    Engine(EngineErrorKind),

    /// Identity, token or network failure while building a session
    #[error("Session error: {0}")]
    Session(String),

    /// Malformed backend endpoint configuration
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The wall-clock deadline elapsed before a terminal result arrived
    #[error("{operation} {resource:?} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        resource: String,
        after: Duration,
    },

    /// The operation's cancellation scope fired
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// The engine process could not be started or exited abnormally
    #[error("Process error for command `{command}`: {message}")]
    Process { command: String, message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Context wrapper naming the failed step and resource
    #[error("{operation} {resource:?} failed: {source}")]
    Operation {
        operation: &'static str,
        resource: String,
        #[source]
        source: Box<BackhaulError>,
    },

    /// A bounded retry loop gave up; `source` is the last observed error
    #[error("{operation} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<BackhaulError>,
    },
}

impl BackhaulError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new session error
    pub fn session<S: Into<String>>(msg: S) -> Self {
        Self::Session(msg.into())
    }

    /// Create a new invalid endpoint error
    pub fn invalid_endpoint<S: Into<String>>(msg: S) -> Self {
        Self::InvalidEndpoint(msg.into())
    }

    /// Create a new process error
    pub fn process<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        Self::Process {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Wrap with the failed step and resource name
    pub fn context(self, operation: &'static str, resource: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            resource: resource.into(),
            source: Box::new(self),
        }
    }

    /// The classified engine failure, looking through context wrappers
    pub fn engine_kind(&self) -> Option<&EngineErrorKind> {
        match self {
            BackhaulError::Engine(kind) => Some(kind),
            BackhaulError::Operation { source, .. } => source.engine_kind(),
            BackhaulError::RetriesExhausted { source, .. } => source.engine_kind(),
            _ => None,
        }
    }

    pub fn is_token_expired(&self) -> bool {
        self.engine_kind().is_some_and(EngineErrorKind::is_token_expired)
    }
}

impl From<EngineErrorKind> for BackhaulError {
    fn from(kind: EngineErrorKind) -> Self {
        BackhaulError::Engine(kind)
    }
}

impl From<reqwest::Error> for BackhaulError {
    fn from(err: reqwest::Error) -> Self {
        BackhaulError::Http(err.to_string())
    }
}

impl From<RetryError<BackhaulError>> for BackhaulError {
    fn from(err: RetryError<BackhaulError>) -> Self {
        match err {
            RetryError::MaxRetriesExceeded {
                operation,
                attempts,
                source,
            } => BackhaulError::RetriesExhausted {
                operation,
                attempts,
                source: Box::new(source),
            },
            RetryError::Permanent { source, .. } => source,
        }
    }
}

impl RetryableError for BackhaulError {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            BackhaulError::Validation(_)
                | BackhaulError::InvalidEndpoint(_)
                | BackhaulError::Cancelled(_)
        )
    }
}
