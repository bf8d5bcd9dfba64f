//! Method and Reply envelopes.
//!
//! Every frame on the socket is a JSON object tagged by its `type` field:
//!
//! ```text
//! {"type": "method", "id": 7, "method": "hello", "params": {...}, "discard": false}
//! {"type": "reply",  "id": 7, "error": null, "result": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::error::WireError;

/// Reply error code sent when no handler is registered for a method name
pub const UNKNOWN_METHOD_NAME: i64 = 4003;

/// Monotonic method id counter, one per engine instance
#[derive(Debug, Clone)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    /// Create a sequence whose first id is 1
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next id
    pub fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The id the next call to [`IdSequence::next`] will return
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A request or push frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    /// Sender-assigned id, echoed by the matching reply
    pub id: u64,
    /// Method name
    pub method: String,
    /// Arbitrary payload
    #[serde(default)]
    pub params: Value,
    /// Whether the sender does not want a reply
    #[serde(default)]
    pub discard: bool,
}

impl Method {
    /// Build a method envelope
    pub fn new(id: u64, method: impl Into<String>, params: Value, discard: bool) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            discard,
        }
    }

    /// Whether the sender waits for a reply to this method
    pub fn expects_reply(&self) -> bool {
        !self.discard
    }

    /// Build a successful reply to this method
    pub fn reply(&self, result: Value) -> Reply {
        Reply::success(self.id, result)
    }

    /// Build an error reply to this method
    pub fn reply_error(&self, error: ReplyError) -> Reply {
        Reply::failure(self.id, error)
    }
}

/// Structured error carried by a reply
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ReplyError {
    /// Numeric error code
    pub code: i64,
    /// Human readable message
    pub message: String,
    /// Optional path into the params that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ReplyError {
    /// Build an error without a path
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    /// Attach a path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Error returned for a method nobody handles
    pub fn unknown_method(name: &str) -> Self {
        Self::new(UNKNOWN_METHOD_NAME, format!("unknown method name: {}", name))
    }
}

/// A response frame correlated to a method by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the method this answers
    pub id: u64,
    /// Failure details, `null` on success
    #[serde(default)]
    pub error: Option<ReplyError>,
    /// Result payload, `null` on failure
    #[serde(default)]
    pub result: Value,
}

impl Reply {
    /// Successful reply
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            error: None,
            result,
        }
    }

    /// Failed reply
    pub fn failure(id: u64, error: ReplyError) -> Self {
        Self {
            id,
            error: Some(error),
            result: Value::Null,
        }
    }

    /// Collapse into the outcome a caller sees; a non-null error wins
    pub fn into_result(self) -> Result<Value, ReplyError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

/// Any frame exchanged on the socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    /// Request or push
    Method(Method),
    /// Response
    Reply(Reply),
}

impl Packet {
    /// Parse a text frame, classifying it by its `type` field
    pub fn parse(frame: &str) -> Result<Packet, WireError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| WireError::malformed(format!("invalid json: {}", e)))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => {
                return Err(WireError::malformed(format!(
                    "type must be a string, got {}",
                    other
                )))
            }
            None => return Err(WireError::malformed("missing type field")),
        };

        let packet = match kind.as_str() {
            "method" => serde_json::from_value::<Method>(value)
                .map(Packet::Method)
                .map_err(|e| WireError::malformed(format!("bad method: {}", e)))?,
            "reply" => serde_json::from_value::<Reply>(value)
                .map(Packet::Reply)
                .map_err(|e| WireError::malformed(format!("bad reply: {}", e)))?,
            other => {
                return Err(WireError::malformed(format!(
                    "unknown packet type {:?}",
                    other
                )))
            }
        };

        trace!(id = packet.id(), "Parsed {} packet", kind);
        Ok(packet)
    }

    /// Encode as a text frame
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Id of the underlying envelope
    pub fn id(&self) -> u64 {
        match self {
            Packet::Method(method) => method.id,
            Packet::Reply(reply) => reply.id,
        }
    }
}

impl From<Method> for Packet {
    fn from(method: Method) -> Self {
        Packet::Method(method)
    }
}

impl From<Reply> for Packet {
    fn from(reply: Reply) -> Self {
        Packet::Reply(reply)
    }
}
