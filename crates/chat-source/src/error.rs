//! Chat source error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ChatSourceError>;

/// Errors that can occur while ingesting chat.
#[derive(Error, Debug)]
pub enum ChatSourceError {
    /// Connection-related errors (handshake, closed socket, writer gone)
    #[error("Connection error: {0}")]
    Connection(String),

    /// IRC parsing errors for a single line
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport errors surfaced by the WebSocket layer
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ChatSourceError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
