//! Transport abstraction and the WebSocket implementation.
//!
//! The engine only ever talks to a [`Connector`] and the [`Transport`] it
//! yields, so tests and embedders can swap the wire without touching the
//! state machine.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::TransportError;

/// Fully resolved handshake parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// URL including auth and extra query parameters
    pub url: Url,
    /// Handshake headers, `Authorization` included when a bearer token is set
    pub headers: Vec<(String, String)>,
}

/// Frame handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Encoded packet
    Text(String),
    /// Keepalive ping with its payload
    Ping(Vec<u8>),
}

/// Something that happened on an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text frame from the peer
    Text(String),
    /// Pong echoing a ping payload
    Pong(Vec<u8>),
    /// The peer closed the connection or the stream ended
    Closed {
        /// Close reason when the peer gave one
        reason: Option<String>,
    },
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake described by `request`
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, TransportError>;
}

/// An open, bidirectional frame stream
#[async_trait]
pub trait Transport: Send {
    /// Write one frame
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError>;

    /// Wait for the next event; must be cancel safe
    async fn recv(&mut self) -> Result<TransportEvent, TransportError>;

    /// Start a graceful close
    async fn close(&mut self);
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>, TransportError> {
        let mut http_request = request.url.as_str().into_client_request()?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Handshake(format!("header {}: {}", name, e)))?;
            http_request.headers_mut().insert(name, value);
        }

        info!("Attempting to connect to {}", redacted(&request.url));
        let (stream, response) = connect_async(http_request).await?;
        debug!("WebSocket handshake completed with status {}", response.status());

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// Client side of a WebSocket connection
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError> {
        let message = match frame {
            Outgoing::Text(text) => Message::Text(text.into()),
            Outgoing::Ping(payload) => Message::Ping(payload.into()),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Ok(TransportEvent::Closed { reason: None }),
            };

            match message {
                Message::Text(text) => return Ok(TransportEvent::Text(text.as_str().to_owned())),
                Message::Pong(payload) => return Ok(TransportEvent::Pong(payload.to_vec())),
                Message::Close(frame) => {
                    return Ok(TransportEvent::Closed {
                        reason: frame.map(|f| f.reason.as_str().to_owned()),
                    })
                }
                Message::Binary(data) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                // tungstenite answers pings on the next write
                Message::Ping(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing websocket: {}", e);
        }
    }
}

/// URL with the query stripped so a JWT never lands in the logs
pub(crate) fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_drops_query() {
        let url = Url::parse("ws://127.0.0.1:1339/gameplay?jwt=secret&x=1").unwrap();
        assert_eq!(redacted(&url), "ws://127.0.0.1:1339/gameplay");
    }

    #[tokio::test]
    async fn test_connect_refused_is_an_error() {
        // Bind and drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = ConnectRequest {
            url: Url::parse(&format!("ws://{}/", addr)).unwrap(),
            headers: vec![],
        };
        let result = WebSocketConnector.connect(&request).await;
        assert!(matches!(result, Err(TransportError::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_bad_header_is_a_handshake_error() {
        let request = ConnectRequest {
            url: Url::parse("ws://127.0.0.1:1/").unwrap(),
            headers: vec![("bad header".to_string(), "v".to_string())],
        };
        let result = WebSocketConnector.connect(&request).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
