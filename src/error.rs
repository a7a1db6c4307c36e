//! Error types for the chat router.

use thiserror::Error;

/// Chat router errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// IO error (socket, poll)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream-level protocol error
    #[error("stream error: {0}")]
    Stream(String),

    /// Peer link key verification failed
    #[error("dialback key mismatch for {0}")]
    KeyMismatch(String),

    /// No route to the given address
    #[error("no route to {0}")]
    NoRoute(String),

    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
