//! Error types for the overlay engine.
//!
//! Errors fall into three groups that callers usually handle differently:
//!
//! - **Cancellation**: the caller gave up waiting, or the engine closed
//!   underneath the call ([`EngineError::is_cancellation`]).
//! - **Rejection**: the request itself was invalid (bad node, bad address,
//!   unsupported protocol). Retrying unchanged will fail again.
//! - **Path/transport**: no route, refused or reset connections, relay and
//!   I/O failures. These may clear up as the network changes.
//!
//! # Example
//!
//! ```no_run
//! use tailmesh_core::EngineError;
//!
//! fn report(err: &EngineError) {
//!     if err.is_cancellation() {
//!         println!("gave up waiting: {err}");
//!     } else {
//!         println!("failed: {err}");
//!     }
//! }
//! ```

use std::borrow::Cow;
use std::net::SocketAddr;
use tailmesh_crypto::CryptoError;
use tailmesh_relay::RelayError;
use thiserror::Error;

/// Errors returned by [`Engine`](crate::Engine) operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ============ Lifecycle ============
    /// Engine could not be constructed (bad options, socket setup failure)
    #[error("Engine construction failed: {0}")]
    Construction(Cow<'static, str>),

    /// The caller's cancellation token fired first
    #[error("Operation cancelled")]
    Cancelled,

    /// The engine has been closed
    #[error("Engine closed")]
    Closed,

    // ============ Directory ============
    /// A node descriptor was rejected
    #[error("Invalid node: {0}")]
    InvalidNode(Cow<'static, str>),

    // ============ Paths ============
    /// Direct or relayed path negotiation failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// No known peer owns the address, or no path to it exists
    #[error("No route to {0}")]
    NoRoute(String),

    // ============ Transport ============
    /// Nothing listens on the remote port
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),

    /// The stream was reset
    #[error("Connection reset: {0}")]
    ConnectionReset(Cow<'static, str>),

    /// Only `tcp` is supported
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The overlay port is already bound
    #[error("Address in use: {0}")]
    AddressInUse(SocketAddr),

    /// Malformed or non-overlay address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ============ Underlying ============
    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Relay failure
    #[error("Relay error: {0}")]
    Relay(String),
}

impl EngineError {
    /// Returns true if the call ended because waiting was abandoned, either
    /// by the caller's token or by the engine closing.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::Closed)
    }

    /// Returns true if retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Handshake(_)
                | EngineError::NoRoute(_)
                | EngineError::ConnectionReset(_)
                | EngineError::Io(_)
                | EngineError::Relay(_)
        )
    }

    /// Create a construction error with static context
    #[must_use]
    pub const fn construction(context: &'static str) -> Self {
        EngineError::Construction(Cow::Borrowed(context))
    }

    /// Create an invalid node error with static context
    #[must_use]
    pub const fn invalid_node(context: &'static str) -> Self {
        EngineError::InvalidNode(Cow::Borrowed(context))
    }

    /// Create a connection reset error with static context
    #[must_use]
    pub const fn reset(context: &'static str) -> Self {
        EngineError::ConnectionReset(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        EngineError::Crypto(err.to_string())
    }
}

impl From<RelayError> for EngineError {
    fn from(err: RelayError) -> Self {
        EngineError::Relay(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<EngineError> for std::io::Error {
    fn from(err: EngineError) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            EngineError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            EngineError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            EngineError::AddressInUse(_) => ErrorKind::AddrInUse,
            EngineError::Cancelled => ErrorKind::Interrupted,
            EngineError::Closed => ErrorKind::NotConnected,
            EngineError::InvalidAddress(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
