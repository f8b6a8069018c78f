use std::string::FromUtf8Error;
use thiserror::Error;

/// Errors that can occur during bit-level serialization.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bits remaining in the stream for the requested read.
    #[error("not enough bits in stream: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// Attempted to write to a stream backed by a borrowed, read-only buffer.
    #[error("write to a read-only bit stream")]
    ReadOnly,

    /// Attempted to decode a string that was not valid UTF-8.
    #[error("invalid UTF-8 string data: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// An invalid or inconsistent value was encountered while decoding.
    #[error("invalid data encountered: {0}")]
    InvalidData(String),
}

/// Result type alias for binary operations.
pub type Result<T> = std::result::Result<T, BinaryError>;
