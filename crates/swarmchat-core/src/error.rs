//! Error types for the swarmchat session layer

use thiserror::Error;

/// Main error type for session, protocol and transport operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Subscribe, publish or key registration failed in the transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires state that is not there yet (e.g. no local profile)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Referenced contact, request or conversation is gone
    #[error("Not found: {0}")]
    NotFound(String),

    /// Inbound payload parsed as JSON but did not match its declared kind
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A handshake step was cancelled through its token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

impl From<postcard::Error> for ChatError {
    fn from(e: postcard::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;
