//! The socket engine.
//!
//! [`InteractiveSocket`] owns one driver task that connects, runs the
//! connection loop, and reconnects with backoff until the socket is closed.
//! Callers never touch the transport: they push encoded frames into the
//! driver's outbound channel, and every state transition happens under a
//! single mutex that is never held across an `.await`.

use interactive_wire::{IdSequence, Method, Packet, Reply};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{SocketError, TransportError};
use crate::keepalive::KeepaliveState;
use crate::options::{CompressionScheme, SocketOptions, SocketOptionsUpdate};
use crate::pending::{PendingCall, PendingTable};
use crate::reconnection::{ReconnectionPolicy, SharedPolicy};
use crate::transport::{redacted, Connector, Outgoing, Transport, TransportEvent, WebSocketConnector};

/// Capacity of the event channel; slow subscribers lose the oldest events
pub const EVENT_CAPACITY: usize = 256;

/// Reason reported when the owner closes the socket
pub const CLOSED_BY_CLIENT: &str = "closed by client";

/// Lifecycle of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Built, `connect()` not called yet
    Idle,
    /// Handshake in flight or waiting out a backoff delay
    Connecting,
    /// Connected; frames flow
    Open,
    /// `close()` in progress
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something observers may want to know about
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A connection opened and the retry queue was flushed
    Opened,
    /// A connection ended, by loss or by `close()`
    Closed {
        /// Why it ended
        reason: String,
    },
    /// The peer sent a method
    Method(Method),
    /// A text frame was written
    Sent(String),
    /// A text frame arrived
    Received(String),
    /// A frame could not be parsed and was dropped
    ProtocolError(String),
    /// A connection attempt failed
    TransportError(String),
}

struct EngineState {
    conn: ConnectionState,
    options: Arc<SocketOptions>,
    ids: IdSequence,
    pending: PendingTable,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    state: Mutex<EngineState>,
    events: broadcast::Sender<SocketEvent>,
    method_sinks: Mutex<Vec<mpsc::UnboundedSender<Method>>>,
    shutdown: watch::Sender<bool>,
    connector: Arc<dyn Connector>,
}

enum ConnectionEnd {
    Shutdown,
    Lost(String),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self) -> Arc<SocketOptions> {
        self.lock().options.clone()
    }

    fn emit(&self, event: SocketEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Move to `Open` and queue the replay; `None` if closed meanwhile
    fn on_open(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut state = self.lock();
        if state.conn != ConnectionState::Connecting {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let replay = state.pending.replay();
        if !replay.is_empty() {
            debug!("Replaying {} queued frames", replay.len());
        }
        for (_, frame) in replay {
            let _ = tx.send(frame);
        }

        state.conn = ConnectionState::Open;
        state.outbound = Some(tx);
        lock_policy(state.options.reconnection_policy()).reset();
        self.emit(SocketEvent::Opened);
        Some(rx)
    }

    /// Back to `Connecting` after an unexpected loss; false once closed
    fn on_lost(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if matches!(state.conn, ConnectionState::Closing | ConnectionState::Closed) {
            return false;
        }
        state.conn = ConnectionState::Connecting;
        state.outbound = None;
        self.emit(SocketEvent::Closed {
            reason: reason.to_string(),
        });
        true
    }

    fn is_closed(&self) -> bool {
        matches!(self.lock().conn, ConnectionState::Closing | ConnectionState::Closed)
    }

    fn handle_frame(&self, text: String) {
        self.emit(SocketEvent::Received(text.clone()));

        match Packet::parse(&text) {
            Ok(Packet::Method(method)) => {
                debug!("Received method {} (id {})", method.method, method.id);
                self.method_sinks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|sink| sink.send(method.clone()).is_ok());
                self.emit(SocketEvent::Method(method));
            }
            Ok(Packet::Reply(reply)) => {
                let id = reply.id;
                if !self.lock().pending.settle(reply) {
                    debug!("Ignoring reply for unknown id {}", id);
                }
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.emit(SocketEvent::ProtocolError(e.to_string()));
            }
        }
    }
}

fn lock_policy(policy: &SharedPolicy) -> MutexGuard<'_, dyn ReconnectionPolicy + 'static> {
    policy.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the call from the table if the caller stops waiting
struct CallGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(self.id);
    }
}

/// Client side of the interactive protocol over a reconnecting transport
pub struct InteractiveSocket {
    shared: Arc<Shared>,
}

impl InteractiveSocket {
    /// Create an idle socket that will connect over WebSocket
    pub fn new(options: SocketOptions) -> Self {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    /// Create an idle socket using a custom transport
    pub fn with_connector(options: SocketOptions, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    conn: ConnectionState::Idle,
                    options: Arc::new(options),
                    ids: IdSequence::new(),
                    pending: PendingTable::default(),
                    outbound: None,
                }),
                events,
                method_sinks: Mutex::new(Vec::new()),
                shutdown,
                connector,
            }),
        }
    }

    /// Start connecting in the background.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// connecting or open does nothing.
    pub fn connect(&self) -> Result<(), SocketError> {
        let mut state = self.shared.lock();
        match state.conn {
            ConnectionState::Idle => {}
            ConnectionState::Connecting | ConnectionState::Open => return Ok(()),
            other => return Err(SocketError::InvalidState(other)),
        }

        state.conn = ConnectionState::Connecting;
        let shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(run_driver(self.shared.clone(), shutdown));
        Ok(())
    }

    /// Send a method.
    ///
    /// With `expect_reply` the call waits for the matching reply, surviving
    /// reconnects until `reply_timeout` elapses. Without it the method goes
    /// out with `discard` set (or on the next open) and `Value::Null` is
    /// returned straight away.
    pub async fn execute<P: Serialize>(
        &self,
        method: &str,
        params: P,
        expect_reply: bool,
    ) -> Result<Value, SocketError> {
        let params = serde_json::to_value(params)?;

        if !expect_reply {
            self.send_discard(method, params)?;
            return Ok(Value::Null);
        }

        let (mut rx, id, after) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if matches!(state.conn, ConnectionState::Closing | ConnectionState::Closed) {
                return Err(SocketError::Closed);
            }

            let id = state.ids.next();
            let call = Method::new(id, method, params, false);
            let frame = Packet::from(call.clone()).encode()?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, PendingCall::new(&call, frame.clone(), tx));

            if state.conn == ConnectionState::Open {
                if let Some(outbound) = &state.outbound {
                    if outbound.send(frame).is_ok() {
                        state.pending.mark_sent(id);
                    }
                }
            }
            (rx, id, state.options.reply_timeout())
        };

        let _guard = CallGuard {
            shared: &self.shared,
            id,
        };

        match timeout(after, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SocketError::Cancelled {
                method: method.to_string(),
                id,
            }),
            Err(_) => {
                // The reply may have been settled just as the timer fired
                let mut state = self.shared.lock();
                if state.pending.remove(id).is_some() {
                    debug!("Method {} (id {}) timed out after {:?}", method, id, after);
                    return Err(SocketError::Timeout {
                        method: method.to_string(),
                        id,
                        after,
                    });
                }
                rx.try_recv().unwrap_or(Err(SocketError::Cancelled {
                    method: method.to_string(),
                    id,
                }))
            }
        }
    }

    fn send_discard(&self, method: &str, params: Value) -> Result<(), SocketError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if matches!(state.conn, ConnectionState::Closing | ConnectionState::Closed) {
            return Err(SocketError::Closed);
        }

        let id = state.ids.next();
        let frame = Packet::from(Method::new(id, method, params, true)).encode()?;
        let sent = match (&state.outbound, state.conn) {
            (Some(outbound), ConnectionState::Open) => outbound.send(frame.clone()).is_ok(),
            _ => false,
        };
        if !sent {
            debug!("Buffering {} (id {}) until the next open", method, id);
            state.pending.defer(id, frame);
        }
        Ok(())
    }

    /// Answer a method the peer sent
    pub fn reply(&self, reply: Reply) -> Result<(), SocketError> {
        let frame = Packet::from(reply).encode()?;
        let state = self.shared.lock();
        match (&state.outbound, state.conn) {
            (Some(outbound), ConnectionState::Open) => outbound
                .send(frame)
                .map_err(|_| SocketError::NotConnected),
            _ => Err(SocketError::NotConnected),
        }
    }

    /// Merge an update into the options; on error nothing changes
    pub fn set_options(&self, update: SocketOptionsUpdate) -> Result<(), SocketError> {
        let mut state = self.shared.lock();
        let merged = state.options.merged(update)?;
        state.options = Arc::new(merged);
        Ok(())
    }

    /// Negotiate compression; the scheme the peer picks is adopted.
    ///
    /// Frames themselves are not compressed.
    pub async fn set_compression(
        &self,
        preferences: &[CompressionScheme],
    ) -> Result<CompressionScheme, SocketError> {
        let result = self
            .execute("setCompression", json!({ "params": preferences }), true)
            .await?;

        let scheme = result
            .get("scheme")
            .cloned()
            .ok_or_else(|| SocketError::UnexpectedReply {
                method: "setCompression".to_string(),
                reason: "missing scheme".to_string(),
            })
            .and_then(|scheme| {
                serde_json::from_value::<CompressionScheme>(scheme).map_err(|e| {
                    SocketError::UnexpectedReply {
                        method: "setCompression".to_string(),
                        reason: e.to_string(),
                    }
                })
            })?;

        info!("Negotiated compression scheme {}", scheme);
        self.set_options(SocketOptionsUpdate {
            compression_scheme: Some(scheme),
            ..Default::default()
        })?;
        Ok(scheme)
    }

    /// Close for good: cancels outstanding calls and stops reconnecting.
    ///
    /// Idempotent and never waits.
    pub fn close(&self) {
        let was_open = {
            let mut state = self.shared.lock();
            if matches!(state.conn, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }

            let was_open = state.conn == ConnectionState::Open;
            state.conn = ConnectionState::Closing;
            let cancelled = state.pending.cancel_all();
            if cancelled > 0 {
                debug!("Cancelled {} outstanding calls", cancelled);
            }
            state.outbound = None;
            state.conn = ConnectionState::Closed;
            was_open
        };

        self.shared.shutdown.send_replace(true);
        info!("Socket closed");
        if was_open {
            self.shared.emit(SocketEvent::Closed {
                reason: CLOSED_BY_CLIENT.to_string(),
            });
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().conn
    }

    /// Calls waiting for a reply
    pub fn queue_size(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Current options snapshot
    pub fn options(&self) -> Arc<SocketOptions> {
        self.shared.options()
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.events.subscribe()
    }

    /// Every method the peer sends from now on, without loss.
    ///
    /// Unlike [`subscribe`](Self::subscribe) this never drops anything for a
    /// slow reader, so it is the feed to answer methods from. The stream ends
    /// when the socket is dropped.
    pub fn methods(&self) -> mpsc::UnboundedReceiver<Method> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .method_sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

impl Drop for InteractiveSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for InteractiveSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveSocket")
            .field("state", &self.state())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

/// Resolves once shutdown has been requested; cancel safe
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_driver(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let options = shared.options();
        let request = options.connect_request();
        let handshake_timeout = options.handshake_timeout();
        let target = redacted(&request.url);

        let attempt = tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => return,
            result = timeout(handshake_timeout, shared.connector.connect(&request)) => match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::Handshake(format!(
                    "no response within {:?}",
                    handshake_timeout
                ))),
            },
        };

        match attempt {
            Ok(mut transport) => {
                let Some(outbound) = shared.on_open() else {
                    transport.close().await;
                    return;
                };
                info!("Connected to {}", target);

                match run_connection(&shared, transport, outbound, &mut shutdown).await {
                    ConnectionEnd::Shutdown => {
                        debug!("Driver for {} stopped", target);
                        return;
                    }
                    ConnectionEnd::Lost(reason) => {
                        if !shared.on_lost(&reason) {
                            return;
                        }
                        warn!("Connection to {} lost: {}", target, reason);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", target, e);
                shared.emit(SocketEvent::TransportError(e.to_string()));
            }
        }

        let delay = {
            let options = shared.options();
            let delay = lock_policy(options.reconnection_policy()).next();
            delay
        };
        debug!("Reconnecting to {} in {:?}", target, delay);

        tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => return,
            _ = sleep(delay) => {}
        }

        if shared.is_closed() {
            return;
        }
    }
}

async fn run_connection(
    shared: &Shared,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let mut keepalive = KeepaliveState::default();
    let mut next_ping = Instant::now() + shared.options().ping_interval();

    loop {
        let ping_interval: Duration = shared.options().ping_interval();
        let pong_deadline = keepalive.deadline(ping_interval);

        tokio::select! {
            biased;

            _ = shutdown_requested(shutdown) => {
                transport.close().await;
                return ConnectionEnd::Shutdown;
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = transport.send(Outgoing::Text(frame.clone())).await {
                    return ConnectionEnd::Lost(format!("send failed: {}", e));
                }
                shared.emit(SocketEvent::Sent(frame));
            }

            event = transport.recv() => match event {
                Ok(TransportEvent::Text(text)) => shared.handle_frame(text),
                Ok(TransportEvent::Pong(payload)) => {
                    match keepalive.process_pong(&payload, Instant::now()) {
                        Some(rtt) => debug!("Keepalive round trip {:?}", rtt),
                        None => debug!("Ignoring unsolicited pong"),
                    }
                }
                Ok(TransportEvent::Closed { reason }) => {
                    return ConnectionEnd::Lost(
                        reason
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "connection closed by peer".to_string()),
                    );
                }
                Err(e) => return ConnectionEnd::Lost(e.to_string()),
            },

            _ = sleep_until_opt(pong_deadline) => {
                return ConnectionEnd::Lost("keepalive timeout".to_string());
            }

            _ = sleep_until(next_ping) => {
                let payload = keepalive.record_ping(Instant::now());
                if let Err(e) = transport.send(Outgoing::Ping(payload)).await {
                    return ConnectionEnd::Lost(format!("ping failed: {}", e));
                }
                next_ping = Instant::now() + shared.options().ping_interval();
            }
        }
    }
}
