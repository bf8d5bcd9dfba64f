//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not a valid method or reply envelope
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// What did not match
        reason: String,
    },

    /// Packet could not be serialized
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WireError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        WireError::MalformedPacket {
            reason: reason.into(),
        }
    }
}
