//! Error types for GOOSE framing and messaging

use thiserror::Error;

/// GOOSE layer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GooseError {
    /// A frame or message could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Received bytes do not form a valid frame or message
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// HMAC mismatch, missing signature or unusable key
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The link layer failed to send or receive
    #[error("Link error: {0}")]
    Link(String),
}

impl GooseError {
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }
}

impl From<std::io::Error> for GooseError {
    fn from(err: std::io::Error) -> Self {
        Self::Link(err.to_string())
    }
}

/// Result type for GOOSE operations
pub type GooseResult<T> = Result<T, GooseError>;
