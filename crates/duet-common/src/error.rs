//! Common error types for Duet.

use thiserror::Error;

/// Result type alias using Duet's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Duet operations.
///
/// The negotiation-facing variants map one-to-one onto how a session reacts:
/// protocol, transport and engine errors end the session, precondition
/// violations are handed back to the caller and change nothing.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer (or the room) broke the signaling protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The signaling channel failed or closed underneath us
    #[error("transport error: {0}")]
    Transport(String),

    /// The session engine reported a failed operation
    #[error("session engine error: {0}")]
    Engine(String),

    /// The caller used an operation outside of its contract
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a session engine error from any displayable type.
    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    /// Create a precondition error from any displayable type.
    pub fn precondition(msg: impl std::fmt::Display) -> Self {
        Self::Precondition(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// True when the signaling channel itself is broken, so the peer can no
    /// longer be told about a teardown.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
