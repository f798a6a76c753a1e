//! Relay error types.

use crate::protocol::RelayErrorCode;
use std::fmt;

/// Relay errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Serialization error
    Serialization(String),
    /// Deserialization error
    Deserialization(String),
    /// Network I/O error
    Io(String),
    /// Connection timeout
    Timeout,
    /// Frame exceeds the protocol limit
    FrameTooLarge(usize),
    /// The native upgrade was answered with something other than 101.
    UpgradeRejected {
        /// HTTP status code of the rejecting response
        status: u16,
        /// Response body (usually the header validation failure)
        body: String,
    },
    /// HTTP or WebSocket handshake failure
    Handshake(String),
    /// Peer closed the connection
    Closed,
    /// Client not registered
    NotRegistered,
    /// Peer not found
    PeerNotFound,
    /// Rate limited
    RateLimited,
    /// Invalid message
    InvalidMessage,
    /// Server full
    ServerFull,
    /// Client could not prove ownership of its key
    KeyProofFailed,
    /// Invalid relay map
    InvalidMap(String),
    /// Internal error
    Internal(String),
}

impl RelayError {
    /// Returns true if reconnecting later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::Timeout
                | RelayError::Closed
                | RelayError::ServerFull
                | RelayError::RateLimited
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Serialization(e) => write!(f, "Serialization error: {e}"),
            RelayError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            RelayError::Io(e) => write!(f, "I/O error: {e}"),
            RelayError::Timeout => write!(f, "Connection timeout"),
            RelayError::FrameTooLarge(n) => write!(f, "Frame too large: {n} bytes"),
            RelayError::UpgradeRejected { status, body } => write!(
                f,
                "GET failed with status code {status} (a proxy could be disallowing the use of 'Upgrade: derp'): {body}"
            ),
            RelayError::Handshake(e) => write!(f, "Handshake failed: {e}"),
            RelayError::Closed => write!(f, "Connection closed"),
            RelayError::NotRegistered => write!(f, "Client not registered"),
            RelayError::PeerNotFound => write!(f, "Peer not found"),
            RelayError::RateLimited => write!(f, "Rate limited"),
            RelayError::InvalidMessage => write!(f, "Invalid message"),
            RelayError::ServerFull => write!(f, "Server at capacity"),
            RelayError::KeyProofFailed => write!(f, "Key ownership proof failed"),
            RelayError::InvalidMap(e) => write!(f, "Invalid relay map: {e}"),
            RelayError::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => RelayError::Closed,
            std::io::ErrorKind::TimedOut => RelayError::Timeout,
            _ => RelayError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RelayError::Timeout
    }
}

impl From<RelayErrorCode> for RelayError {
    fn from(code: RelayErrorCode) -> Self {
        match code {
            RelayErrorCode::NotRegistered => RelayError::NotRegistered,
            RelayErrorCode::PeerNotFound => RelayError::PeerNotFound,
            RelayErrorCode::RateLimited => RelayError::RateLimited,
            RelayErrorCode::InvalidMessage => RelayError::InvalidMessage,
            RelayErrorCode::ServerFull => RelayError::ServerFull,
            RelayErrorCode::KeyProofFailed => RelayError::KeyProofFailed,
            RelayErrorCode::InternalError => RelayError::Internal("Unknown error".to_string()),
        }
    }
}
