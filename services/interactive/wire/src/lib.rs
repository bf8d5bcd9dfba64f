//! Method/Reply packet envelopes and JSON framing for the interactive protocol.
//!
//! This crate provides the packet model shared by the socket engine and its
//! consumers: immutable `Method` and `Reply` envelopes, the per-engine id
//! counter, and parsing of raw text frames into one or the other.
//!
//! ## Wire Format
//!
//! Frames are JSON objects sent as WebSocket text messages:
//!
//! ```text
//! +---------+----------------------------------------------------------+
//! | method  | {"id", "type": "method", "method", "params", "discard"}  |
//! +---------+----------------------------------------------------------+
//! | reply   | {"id", "type": "reply", "error": {..}|null, "result"}    |
//! +---------+----------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod packet;

// Re-export main types
pub use error::WireError;
pub use packet::{IdSequence, Method, Packet, Reply, ReplyError, UNKNOWN_METHOD_NAME};
