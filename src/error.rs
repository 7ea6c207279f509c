//! Error types for isyntax_core.

use thiserror::Error;

/// Error types for slide and tile operations.
#[derive(Error, Debug)]
pub enum IsyntaxError {
    /// Bad caller input: unknown pixel format, coordinates out of range,
    /// block-dimension mismatch at inject time, wrong buffer size.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested entity (level, tile grid, embedded image) is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed codeblock bitstream.
    #[error("Failed to decompress codeblock: {0}")]
    Decompress(String),

    /// A coefficient pool refused to grow past its configured cap.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Invariant violation on a path that should be unreachable.
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Result type alias for slide and tile operations.
pub type IsyntaxResult<T> = Result<T, IsyntaxError>;

impl IsyntaxError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        IsyntaxError::InvalidArgument(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        IsyntaxError::NotFound(message.into())
    }
}
