//! Client wrapper tying a socket to a handler registry.

use interactive_session::{
    CompressionScheme, ConnectionState, Connector, InteractiveSocket, SocketError, SocketEvent, SocketOptions,
    SocketOptionsUpdate,
};
use interactive_wire::{Method, Reply};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{HandlerRegistry, MethodHandler};

#[derive(Default)]
struct Active {
    socket: Option<Arc<InteractiveSocket>>,
    pump: Option<JoinHandle<()>>,
}

impl Active {
    fn shut_down(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// A socket plus the handlers that answer the peer's methods
pub struct Client {
    registry: HandlerRegistry,
    active: Mutex<Active>,
}

impl Client {
    /// Create a client with the built-in `hello` handler
    pub fn new() -> Self {
        let registry = HandlerRegistry::new();
        registry.add_fn("hello", |method| {
            info!("Peer said hello: {}", method.params);
            Ok(None)
        });

        Self {
            registry,
            active: Mutex::new(Active::default()),
        }
    }

    fn active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self) -> Result<Arc<InteractiveSocket>, SocketError> {
        self.active().socket.clone().ok_or(SocketError::NotConnected)
    }

    /// Handler registry
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register a handler for `method`
    pub fn add_handler<H: MethodHandler + 'static>(&self, method: impl Into<String>, handler: H) {
        self.registry.add_handler(method, handler);
    }

    /// Unregister the handler for `method`
    pub fn remove_handler(&self, method: &str) -> bool {
        self.registry.remove_handler(method)
    }

    /// Connect over WebSocket, replacing (and closing) any previous socket.
    ///
    /// The returned receiver is subscribed before connecting, so it sees the
    /// first `Opened`.
    pub fn open(&self, options: SocketOptions) -> Result<broadcast::Receiver<SocketEvent>, SocketError> {
        self.install(InteractiveSocket::new(options))
    }

    /// Connect through a custom transport
    pub fn open_with_connector(
        &self,
        options: SocketOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<broadcast::Receiver<SocketEvent>, SocketError> {
        self.install(InteractiveSocket::with_connector(options, connector))
    }

    fn install(&self, socket: InteractiveSocket) -> Result<broadcast::Receiver<SocketEvent>, SocketError> {
        let socket = Arc::new(socket);
        let events = socket.subscribe();
        let pump = tokio::spawn(pump_methods(
            Arc::downgrade(&socket),
            self.registry.clone(),
            socket.methods(),
        ));

        {
            let mut active = self.active();
            if active.socket.is_some() {
                debug!("Replacing previous socket");
            }
            active.shut_down();
            active.socket = Some(socket.clone());
            active.pump = Some(pump);
        }

        socket.connect()?;
        Ok(events)
    }

    /// Call a method on the peer
    pub async fn execute<P: Serialize>(
        &self,
        method: &str,
        params: P,
        expect_reply: bool,
    ) -> Result<Value, SocketError> {
        self.socket()?.execute(method, params, expect_reply).await
    }

    /// Merge options into the current socket's
    pub fn set_options(&self, update: SocketOptionsUpdate) -> Result<(), SocketError> {
        self.socket()?.set_options(update)
    }

    /// Negotiate compression with the peer
    pub async fn set_compression(
        &self,
        preferences: &[CompressionScheme],
    ) -> Result<CompressionScheme, SocketError> {
        self.socket()?.set_compression(preferences).await
    }

    /// Send a reply on the current socket
    pub fn reply(&self, reply: Reply) -> Result<(), SocketError> {
        self.socket()?.reply(reply)
    }

    /// Socket events; fails before `open`
    pub fn subscribe(&self) -> Result<broadcast::Receiver<SocketEvent>, SocketError> {
        Ok(self.socket()?.subscribe())
    }

    /// State of the current socket, `Idle` before `open`
    pub fn state(&self) -> ConnectionState {
        self.active()
            .socket
            .as_ref()
            .map_or(ConnectionState::Idle, |socket| socket.state())
    }

    /// Close the socket and stop routing methods
    pub fn close(&self) {
        self.active().shut_down();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Route inbound methods to the registry and send back their replies.
///
/// Methods are handled one at a time in arrival order; the feed is unbounded
/// so a slow handler delays replies but never loses a method.
async fn pump_methods(
    socket: Weak<InteractiveSocket>,
    registry: HandlerRegistry,
    mut methods: mpsc::UnboundedReceiver<Method>,
) {
    while let Some(method) = methods.recv().await {
        let name = method.method.clone();
        let Some(reply) = registry.handle(method).await else {
            continue;
        };
        let Some(socket) = socket.upgrade() else {
            return;
        };
        if let Err(e) = socket.reply(reply) {
            warn!("Failed to reply to {}: {}", name, e);
        }
    }
    debug!("Method pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnHandler;
    use futures::{SinkExt, StreamExt};
    use interactive_session::{shared, FixedReconnectionPolicy};
    use interactive_wire::{Method, ReplyError, UNKNOWN_METHOD_NAME};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    const WAIT: Duration = Duration::from_secs(5);

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (tcp, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        accept_async(tcp).await.unwrap()
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    async fn send_method(ws: &mut WebSocketStream<TcpStream>, id: u64, method: &str, discard: bool) {
        let frame = json!({ "type": "method", "id": id, "method": method, "params": { "n": id }, "discard": discard });
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    fn options(url: &str) -> SocketOptions {
        SocketOptions::builder(url)
            .ping_interval(Duration::from_secs(60))
            .reconnection_policy(shared(FixedReconnectionPolicy::new(Duration::from_millis(5))))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_before_open() {
        let client = Client::new();
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(matches!(
            client.execute("hello", json!(null), true).await,
            Err(SocketError::NotConnected)
        ));
        assert!(matches!(client.reply(Reply::success(1, Value::Null)), Err(SocketError::NotConnected)));
        assert!(client.subscribe().is_err());
        assert!(client.registry().contains("hello"));
    }

    #[tokio::test]
    async fn test_routes_methods_to_handlers() {
        let (listener, url) = bind().await;
        let client = Client::new();
        client.add_handler(
            "double",
            FnHandler::new(|method: &Method| Ok(Some(json!(method.params["n"].as_u64().unwrap_or(0) * 2)))),
        );
        client.open(options(&url)).unwrap();
        let mut ws = accept(&listener).await;

        send_method(&mut ws, 21, "double", false).await;
        let reply = next_text(&mut ws).await;
        assert_eq!(reply, json!({ "type": "reply", "id": 21, "error": null, "result": 42 }));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_reply() {
        let (listener, url) = bind().await;
        let client = Client::new();
        client.open(options(&url)).unwrap();
        let mut ws = accept(&listener).await;

        // A discarded unknown method is dropped silently, so the first reply
        // the server sees answers the second method
        send_method(&mut ws, 1, "mystery", true).await;
        send_method(&mut ws, 2, "mystery", false).await;

        let reply = next_text(&mut ws).await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["error"]["code"], UNKNOWN_METHOD_NAME);
        assert_eq!(reply["error"]["message"], "unknown method name: mystery");
    }

    #[tokio::test]
    async fn test_hello_is_handled_by_default() {
        let (listener, url) = bind().await;
        let client = Client::new();
        client.add_handler("fail", FnHandler::new(|_: &Method| Err(ReplyError::new(4000, "nope"))));
        client.open(options(&url)).unwrap();
        let mut ws = accept(&listener).await;

        send_method(&mut ws, 1, "hello", false).await;
        let reply = next_text(&mut ws).await;
        assert_eq!(reply, json!({ "type": "reply", "id": 1, "error": null, "result": null }));

        send_method(&mut ws, 2, "fail", false).await;
        let reply = next_text(&mut ws).await;
        assert_eq!(reply["error"]["code"], 4000);
    }

    #[tokio::test]
    async fn test_execute_through_client() {
        let (listener, url) = bind().await;
        let client = Arc::new(Client::new());
        client.open(options(&url)).unwrap();
        let mut ws = accept(&listener).await;

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.execute("getScenes", json!(null), true).await })
        };

        let frame = next_text(&mut ws).await;
        assert_eq!(frame["method"], "getScenes");
        let reply = json!({ "type": "reply", "id": frame["id"], "error": null, "result": { "scenes": [] } });
        ws.send(Message::Text(reply.to_string().into())).await.unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), json!({ "scenes": [] }));
        assert_eq!(client.state(), ConnectionState::Open);
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl MethodHandler for SlowHandler {
        async fn handle(&self, method: Method) -> Result<Option<Value>, ReplyError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(Some(json!(method.id)))
        }
    }

    #[tokio::test]
    async fn test_burst_of_methods_all_get_replies() {
        let (listener, url) = bind().await;
        let client = Client::new();
        client.add_handler("slow", SlowHandler);
        client.open(options(&url)).unwrap();
        let mut ws = accept(&listener).await;

        // More methods than the event channel holds, arriving faster than
        // the handler runs
        let burst = 300;
        for id in 1..=burst {
            send_method(&mut ws, id, "slow", false).await;
        }

        for id in 1..=burst {
            let reply = next_text(&mut ws).await;
            assert_eq!(reply["id"], id);
            assert_eq!(reply["result"], id);
        }
    }

    #[tokio::test]
    async fn test_open_returns_events_from_the_start() {
        let (listener, url) = bind().await;
        let client = Client::new();
        let mut events = client.open(options(&url)).unwrap();
        let _ws = accept(&listener).await;

        let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(first, SocketEvent::Opened);
    }

    #[tokio::test]
    async fn test_open_replaces_previous_socket() {
        let (listener, url) = bind().await;
        let client = Client::new();

        client.open(options(&url)).unwrap();
        let mut first = accept(&listener).await;

        client.open(options(&url)).unwrap();
        let _second = accept(&listener).await;

        let ended = timeout(WAIT, async {
            loop {
                match first.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "Expected the first socket to be closed");

        client.close();
        assert_eq!(client.state(), ConnectionState::Idle);
    }
}
