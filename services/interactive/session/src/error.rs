//! Error types for the socket engine.

use interactive_wire::{ReplyError, WireError};
use std::time::Duration;
use thiserror::Error;

use crate::socket::ConnectionState;

/// Invalid socket configuration, raised before any network activity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Both a bearer token and a JWT were supplied
    #[error("cannot use both JWT and OAuth token authentication")]
    AmbiguousAuth,

    /// The socket URL does not parse
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl {
        /// URL as supplied
        url: String,
        /// Parser message
        reason: String,
    },

    /// A header name or value cannot be sent
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader {
        /// Header name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A timeout or interval was zero
    #[error("{name} must be greater than zero")]
    ZeroDuration {
        /// Option name
        name: &'static str,
    },
}

/// Failures of the underlying transport; these drive reconnection and never
/// reach a caller of `execute`
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket protocol or I/O failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection request could not be built
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The connection is already gone
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced by the socket engine
#[derive(Error, Debug)]
pub enum SocketError {
    /// Conflicting or invalid options
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// No reply arrived within the reply timeout
    #[error("method {method} (id {id}) timed out after {after:?}")]
    Timeout {
        /// Method name
        method: String,
        /// Method id
        id: u64,
        /// Timeout that elapsed
        after: Duration,
    },

    /// The socket was closed while the call was outstanding
    #[error("method {method} (id {id}) cancelled: socket closed")]
    Cancelled {
        /// Method name
        method: String,
        /// Method id
        id: u64,
    },

    /// The peer answered with an error
    #[error("remote error: {0}")]
    RemoteMethod(#[from] ReplyError),

    /// A frame could not be encoded or decoded
    #[error(transparent)]
    Malformed(#[from] WireError),

    /// Params could not be converted to JSON
    #[error("failed to encode params: {0}")]
    Encode(#[from] serde_json::Error),

    /// A reply arrived but its result has the wrong shape
    #[error("unexpected reply to {method}: {reason}")]
    UnexpectedReply {
        /// Method name
        method: String,
        /// What was wrong with the result
        reason: String,
    },

    /// The operation needs an open connection
    #[error("socket is not connected")]
    NotConnected,

    /// The socket has been closed by its owner
    #[error("socket is closed")]
    Closed,

    /// The operation is not valid in the current state
    #[error("invalid state for this operation: {0:?}")]
    InvalidState(ConnectionState),
}

impl SocketError {
    /// Whether this is a reply timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, SocketError::Timeout { .. })
    }

    /// Whether this is a cancellation caused by `close()`
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SocketError::Cancelled { .. })
    }
}
