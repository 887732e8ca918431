//! Error types for the control protocol library.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Errors raised while framing, parsing or interpreting protocol input.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame exceeded the maximum permitted size before its sentinel arrived.
    #[error("frame too large ({size} bytes, limit {limit})")]
    FrameTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// The configured frame size limit.
        limit: usize,
    },

    /// The frame body was not valid JSON for the expected shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// A time interval token did not match the interval grammar.
    #[error("invalid time interval: {0:?}")]
    InvalidInterval(String),

    /// A boolean token was not one of the recognized spellings.
    #[error("invalid boolean: {0:?}")]
    InvalidBoolean(String),

    /// A log level was neither a known name nor a known numeric value.
    #[error("invalid log level: {0:?}")]
    InvalidLogLevel(String),

    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
