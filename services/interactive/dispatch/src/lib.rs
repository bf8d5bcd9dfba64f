//! Method routing for interactive clients.
//!
//! This crate sits on top of the socket engine: a [`HandlerRegistry`] maps
//! inbound method names to handlers, and a [`Client`] owns the socket, pumps
//! its method events through the registry, and sends the replies back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use interactive_dispatch::Client;
//! use interactive_session::SocketOptions;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new();
//! client.registry().add_fn("onReady", |method| {
//!     println!("Ready: {}", method.params);
//!     Ok(None)
//! });
//!
//! client.open(SocketOptions::builder("wss://interactive.example.com/gameplay").build()?)?;
//! client.execute("ready", json!({ "isReady": true }), false).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod registry;

// Re-export main types
pub use client::Client;
pub use registry::{FnHandler, HandlerRegistry, MethodHandler};
