//! Reconnecting socket engine for the interactive protocol.
//!
//! This crate provides the client side of a Method/Reply protocol over a
//! WebSocket: connection lifecycle, auth resolution, reply correlation with
//! timeouts, a retry queue that survives reconnects, and keepalive.
//!
//! ## Features
//!
//! - **State Machine**: `Idle → Connecting → Open → Closing → Closed`
//! - **Auth**: OAuth bearer header or JWT query parameter, never both
//! - **Reply Correlation**: per-call timeout, cancellation on close
//! - **Retry Queue**: unanswered calls resent with the same id after reconnect
//! - **Auto-reconnect**: pluggable backoff, exponential by default
//! - **Keepalive**: PING/PONG with RTT measurement
//!
//! ## Example
//!
//! ```rust,no_run
//! use interactive_session::{InteractiveSocket, SocketEvent, SocketOptions};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = SocketOptions::builder("wss://interactive.example.com/gameplay")
//!     .auth_token("my-oauth-token")
//!     .reply_timeout(Duration::from_secs(5))
//!     .build()?;
//!
//! let socket = InteractiveSocket::new(options);
//! let mut events = socket.subscribe();
//! socket.connect()?;
//!
//! let scenes = socket.execute("getScenes", json!(null), true).await?;
//! println!("Scenes: {}", scenes);
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         SocketEvent::Method(method) => println!("Peer called {}", method.method),
//!         SocketEvent::Closed { reason } => println!("Connection closed: {}", reason),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod keepalive;
pub mod options;
pub mod pending;
pub mod reconnection;
pub mod socket;
pub mod transport;

// Re-export main types
pub use error::{ConfigurationError, SocketError, TransportError};
pub use keepalive::KeepaliveState;
pub use options::{Auth, CompressionScheme, SocketOptions, SocketOptionsBuilder, SocketOptionsUpdate};
pub use reconnection::{
    shared, ExponentialReconnectionPolicy, FixedReconnectionPolicy, ReconnectionPolicy, SharedPolicy,
};
pub use socket::{ConnectionState, InteractiveSocket, SocketEvent};
pub use transport::{
    ConnectRequest, Connector, Outgoing, Transport, TransportEvent, WebSocketConnector, WebSocketTransport,
};
