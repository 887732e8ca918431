//! Unified error handling for jaild.
//!
//! One error hierarchy for the whole daemon, with static codes for log
//! labeling. Transmitter replies carry these errors verbatim as the second
//! element of the `(1, message)` pair.

use thiserror::Error;

/// Result type used throughout the daemon.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur in server, jail, filter and action operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No such jail, action or entry.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate add of a jail, action or entry.
    #[error("{0}")]
    AlreadyExists(String),

    /// A regex, time interval, IP, or option value was rejected.
    #[error("{0}")]
    InvalidArgument(String),

    /// The operation requires that no jail is active.
    #[error("{0}")]
    Busy(String),

    /// Log path missing or unreadable, socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An action command exceeded its timeout.
    #[error("command {command:?} timed out after {seconds}s")]
    Timeout {
        /// The rendered command line.
        command: String,
        /// The configured timeout.
        seconds: u64,
    },

    /// A `<tag>` could not be resolved while rendering a command template.
    #[error("substitution failed: {0}")]
    Substitution(String),

    /// The operation was interrupted by a stop signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A platform capability (backend) is not available.
    #[error("backend unavailable: {0}")]
    Backend(String),

    /// Persistence failure.
    #[error("database error: {0}")]
    Database(#[from] crate::db::DbError),

    /// Protocol-level failure (framing, shared grammars).
    #[error("{0}")]
    Proto(#[from] jail_proto::ProtocolError),
}

impl Error {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Busy(_) => "busy",
            Self::Io(_) => "io",
            Self::Timeout { .. } => "timeout",
            Self::Substitution(_) => "substitution",
            Self::Cancelled => "cancelled",
            Self::Backend(_) => "backend",
            Self::Database(_) => "database",
            Self::Proto(_) => "proto",
        }
    }

    /// Shorthand for a missing jail.
    pub fn no_jail(name: &str) -> Error {
        Error::NotFound(format!("Sorry but the jail '{}' does not exist", name))
    }

    /// Shorthand for a duplicate jail.
    pub fn jail_exists(name: &str) -> Error {
        Error::AlreadyExists(format!("Jail '{}' already exists", name))
    }

    /// Shorthand for a missing action.
    pub fn no_action(jail: &str, name: &str) -> Error {
        Error::NotFound(format!(
            "Action '{}' does not exist for jail '{}'",
            name, jail
        ))
    }
}
