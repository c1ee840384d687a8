//! Client runtime — connection lifecycle, dispatch loop, and public API.
//!
//! One task per connection reads frames in receipt order and dispatches
//! them. Route handlers and remote method invocations run as their own
//! tasks so a slow handler never stalls the read loop. Outstanding calls
//! are failed with [`ClientError::ConnectionLost`] whenever the socket
//! closes; routes and event handlers survive reconnects.

use crate::config::ClientConfig;
use crate::correlation::Correlator;
use crate::error::ClientError;
use crate::events::{Event, EventHub, EventKind};
use crate::object::{ObjectRegistry, Output};
use crate::peer::Peer;
use crate::routes::{Reply, Route, RouteRegistry};

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;
use winerp_wire::{decode, encode, reason, FunctionCall, Message, PayloadType};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on how long [`Client::close`] waits for the socket to shut.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Opening the WebSocket.
    Connecting,
    /// Socket open, verification sent, no answer yet.
    Verifying,
    /// The relay accepted this client's name.
    Authorized,
    /// Another connection holds the name; waiting for it to leave.
    OnHold,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Verifying => "verifying",
            Self::Authorized => "authorized",
            Self::OnHold => "on_hold",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    /// Set while a connection loop owns the client.
    running: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Correlator<Message>,
    events: EventHub,
    routes: RouteRegistry,
    objects: ObjectRegistry,
    shutdown: watch::Sender<bool>,
}

/// A winerp client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                running: AtomicBool::new(false),
                outbound: Mutex::new(None),
                pending: Correlator::new(),
                events: EventHub::new(),
                routes: RouteRegistry::new(),
                objects: ObjectRegistry::new(),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Logical name this client verifies under.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == ConnectionState::Authorized
    }

    pub fn is_on_hold(&self) -> bool {
        self.state() == ConnectionState::OnHold
    }

    // ---- Lifecycle ----

    /// Connect to the relay and start the dispatch loop.
    ///
    /// Returns once the socket is open; verification completes in the
    /// background (see [`Client::wait_until_ready`]).
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.name().is_empty() {
            return Err(ClientError::InvalidArguments(
                "client name must not be empty".to_string(),
            ));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        self.set_state(ConnectionState::Connecting);

        let ws = match self.open().await {
            Ok(ws) => ws,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let client = self.clone();
        tokio::spawn(async move {
            client.run(ws, shutdown).await;
        });
        Ok(())
    }

    /// Stop reconnecting and close the socket. Outstanding calls fail with
    /// [`ClientError::ConnectionLost`].
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let mut state = self.inner.state.subscribe();
        let stopped = state.wait_for(|s| {
            *s == ConnectionState::Disconnected && !self.inner.running.load(Ordering::SeqCst)
        });
        if tokio::time::timeout(CLOSE_TIMEOUT, stopped).await.is_err() {
            warn!(name = %self.name(), "Timed out waiting for connection to close");
        }
    }

    /// Wait until the relay has verified this client.
    pub async fn wait_until_ready(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Authorized)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionLost)
    }

    /// Wait for the next disconnect.
    pub async fn wait_until_disconnected(&self) -> Result<(), ClientError> {
        self.inner
            .events
            .wait_for(EventKind::Disconnect, None)
            .await
            .map(|_| ())
    }

    // ---- Routes and events ----

    /// Serve `route` under `name` to other clients.
    pub fn add_route(&self, name: &str, route: impl Route + 'static) -> Result<(), ClientError> {
        self.inner.routes.add(name, route)
    }

    pub fn remove_route(&self, name: &str) -> Result<(), ClientError> {
        self.inner.routes.remove(name)
    }

    /// Names of the routes this client serves.
    pub fn routes(&self) -> Vec<String> {
        self.inner.routes.names()
    }

    /// Set the persistent handler for `kind`, replacing any previous one.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.events.on(kind, handler);
    }

    pub fn off(&self, kind: EventKind) -> bool {
        self.inner.events.off(kind)
    }

    /// Wait for the next `kind` event. `None` waits indefinitely.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        timeout: Option<Duration>,
    ) -> Result<Event, ClientError> {
        self.inner.events.wait_for(kind, timeout).await
    }

    // ---- Calls ----

    /// Invoke `route` on `destination` with keyword arguments `args` (a JSON
    /// object or null), waiting up to the configured default timeout.
    pub async fn call(
        &self,
        route: &str,
        destination: &str,
        args: Value,
    ) -> Result<Output, ClientError> {
        self.call_with_timeout(route, destination, args, self.inner.config.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        route: &str,
        destination: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Output, ClientError> {
        self.ensure_ready()?;
        if !(args.is_object() || args.is_null()) {
            return Err(ClientError::InvalidArguments(
                "call arguments must be a JSON object".to_string(),
            ));
        }
        let msg = Message::new(PayloadType::Request)
            .with_destination(destination)
            .with_route(route)
            .with_data(args);
        let reply = self.request(msg, timeout).await?;
        Output::from_reply(self, reply)
    }

    /// Ask the relay whether `destination` is connected, or whether the
    /// relay itself answers when `destination` is `None`.
    pub async fn ping(&self, destination: Option<&str>) -> bool {
        self.ping_with_timeout(destination, self.inner.config.default_timeout)
            .await
    }

    pub async fn ping_with_timeout(&self, destination: Option<&str>, timeout: Duration) -> bool {
        if let Err(e) = self.ensure_ready() {
            debug!(error = %e, "Ping skipped");
            return false;
        }
        let mut msg = Message::new(PayloadType::Ping);
        if let Some(dest) = destination {
            msg = msg.with_destination(dest);
        }
        match self.request(msg, timeout).await {
            Ok(reply) => reply
                .data()
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                debug!(destination = ?destination, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Send `data` to the named clients, or to every other client when
    /// `destinations` is empty. No delivery guarantee.
    pub fn broadcast(&self, data: Value, destinations: &[&str]) -> Result<(), ClientError> {
        self.ensure_ready()?;
        let mut msg = Message::new(PayloadType::Information)
            .with_id(self.name())
            .with_data(data);
        if !destinations.is_empty() {
            let names: Vec<String> = destinations.iter().map(|d| d.to_string()).collect();
            msg = msg.with_destination(names);
        }
        self.send(msg)
    }

    /// Names of all clients currently verified on the relay.
    pub async fn clients(&self) -> Result<Vec<String>, ClientError> {
        self.ensure_ready()?;
        let reply = self
            .request(
                Message::new(PayloadType::ClientCount),
                self.inner.config.default_timeout,
            )
            .await?;
        Ok(serde_json::from_value(reply.into_data())?)
    }

    /// A handle bound to one remote client.
    pub fn peer(&self, name: impl Into<String>) -> Peer {
        Peer::new(self.clone(), name.into())
    }

    pub(crate) async fn function_call(
        &self,
        source: &str,
        call: FunctionCall,
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        self.ensure_ready()?;
        let msg = Message::new(PayloadType::FunctionCall)
            .with_destination(source)
            .with_data(serde_json::to_value(&call)?);
        self.request(msg, timeout).await
    }

    /// Send `msg` under a fresh correlation id and wait for its reply. The
    /// slot is registered before the message leaves.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, ClientError> {
        let uuid = Uuid::new_v4().to_string();
        let pending = self.inner.pending.register(&uuid, timeout)?;
        self.send(msg.with_id(self.name()).with_uuid(uuid.as_str()))?;
        pending.wait().await
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Authorized => Ok(()),
            ConnectionState::OnHold => Err(ClientError::OnHold),
            ConnectionState::Disconnected => Err(ClientError::NotConnected),
            ConnectionState::Connecting | ConnectionState::Verifying => {
                Err(ClientError::NotAuthorized)
            }
        }
    }

    fn send(&self, msg: Message) -> Result<(), ClientError> {
        match self.outbound().as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(name = %self.name(), from = %previous, to = %state, "State changed");
        }
    }

    // ---- Connection loop ----

    async fn open(&self) -> Result<WsStream, ClientError> {
        let uri = self.inner.config.uri();
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.inner.config.max_message_size);
        ws_config.max_frame_size = Some(self.inner.config.max_message_size);

        let (ws, _response) =
            tokio_tungstenite::connect_async_with_config(uri.as_str(), Some(ws_config), false)
                .await?;
        info!(name = %self.name(), uri = %uri, "Connected to relay");
        Ok(ws)
    }

    async fn run(self, mut ws: WsStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.session(ws, &mut shutdown).await;
            self.on_disconnect();

            if !self.inner.config.reconnect || *shutdown.borrow() {
                break;
            }
            match self.reconnect(&mut shutdown).await {
                Some(next) => ws = next,
                None => break,
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        debug!(name = %self.name(), "Connection loop stopped");
    }

    /// Drive one socket until it closes or shutdown is requested.
    async fn session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) {
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound() = Some(tx);

        // Ends once the outbound sender is dropped.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match encode(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!(error = %e, "Write to relay failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.set_state(ConnectionState::Verifying);
        self.inner.events.dispatch(Event::Connect);
        let verification = Message::new(PayloadType::Verification)
            .with_id(self.name())
            .with_uuid(Uuid::new_v4().to_string());
        if let Err(e) = self.send(verification) {
            warn!(error = %e, "Failed to send verification");
        }

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_frame(text),
                        Err(_) => warn!("Dropped non-UTF-8 binary frame from relay"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(name = %self.name(), "Relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(name = %self.name(), error = %e, "WebSocket read error");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!(name = %self.name(), "Closing connection");
                    break;
                }
            }
        }

        self.outbound().take();
        let _ = writer.await;
    }

    fn on_disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
        let failed = self.inner.pending.fail_all(|| ClientError::ConnectionLost);
        if failed > 0 {
            debug!(name = %self.name(), failed, "Failed outstanding requests");
        }
        self.inner.events.dispatch(Event::Disconnect);
    }

    /// Retry until a socket opens or shutdown is requested.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<WsStream> {
        let interval = self.inner.config.reconnect_interval;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            self.set_state(ConnectionState::Connecting);
            match self.open().await {
                Ok(ws) => return Some(ws),
                Err(e) => {
                    warn!(name = %self.name(), error = %e, retry_in = ?interval, "Reconnect failed")
                }
            }
            self.set_state(ConnectionState::Disconnected);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    // ---- Dispatch ----

    fn handle_frame(&self, text: &str) {
        match decode(text) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                warn!(error = %e, "Undecodable frame from relay");
                self.inner.events.dispatch(Event::Error {
                    message: format!("Invalid message from relay: {e}"),
                });
            }
        }
    }

    fn handle_message(&self, msg: Message) {
        match msg.kind() {
            PayloadType::Success => self.on_success(),
            PayloadType::Request => {
                let client = self.clone();
                tokio::spawn(async move { client.fulfil_request(msg).await });
            }
            PayloadType::FunctionCall => {
                let client = self.clone();
                tokio::spawn(async move { client.fulfil_function_call(msg).await });
            }
            PayloadType::Response => self.resolve(msg, true),
            PayloadType::Ping | PayloadType::ClientCount => self.resolve(msg, false),
            PayloadType::Error => self.on_error(msg),
            PayloadType::Information => {
                let sender = msg.id().map(str::to_string);
                let data = msg.into_data();
                self.inner.events.dispatch(Event::Information { data, sender });
            }
            PayloadType::Verification => debug!("Ignoring verification message from relay"),
        }
    }

    fn on_success(&self) {
        let previous = self.state();
        if previous == ConnectionState::Authorized {
            debug!(name = %self.name(), "Ignoring repeated success");
            return;
        }
        self.set_state(ConnectionState::Authorized);
        if previous == ConnectionState::OnHold {
            info!(name = %self.name(), "Promoted from hold");
        }
        info!(name = %self.name(), "Authorized by relay");
        self.inner.events.dispatch(Event::Ready);
    }

    fn on_error(&self, msg: Message) {
        let text = msg.error_text().unwrap_or_default().to_string();
        if text == reason::ALREADY_AUTHORIZED {
            self.set_state(ConnectionState::OnHold);
            warn!(
                name = %self.name(),
                "Another client with this name is active; waiting on hold"
            );
            return;
        }
        if text == reason::NOT_AUTHORIZED
            && msg.uuid().is_none()
            && self.state() == ConnectionState::OnHold
        {
            // Displaced from hold. Left unverified until the client restarts.
            self.set_state(ConnectionState::Verifying);
            warn!(
                name = %self.name(),
                "A newer connection with this name took the hold slot"
            );
        }

        if let Some(uuid) = msg.uuid() {
            if self.inner.pending.contains(uuid) {
                let _ = self.inner.pending.reject(uuid, ClientError::from_reply(&msg));
            }
        }
        debug!(error = %text, route = ?msg.route(), "Error message received");
        self.inner.events.dispatch(Event::Error { message: text });
    }

    fn resolve(&self, msg: Message, notify: bool) {
        let Some(uuid) = msg.uuid().map(str::to_string) else {
            self.report(ClientError::MissingCorrelationId);
            return;
        };
        match self.inner.pending.resolve(&uuid, msg) {
            Ok(()) if notify => self.inner.events.dispatch(Event::Response { uuid }),
            Ok(()) => {}
            Err(e) => self.report(e),
        }
    }

    fn report(&self, error: ClientError) {
        warn!(name = %self.name(), error = %error, "Dispatch anomaly");
        self.inner.events.dispatch(Event::Error {
            message: error.to_string(),
        });
    }

    async fn fulfil_request(self, msg: Message) {
        let route_name = msg.route().unwrap_or_default().to_string();
        let caller = msg.destination_name().unwrap_or_default().to_string();

        let Some(route) = self.inner.routes.get(&route_name) else {
            info!(route = %route_name, caller = %caller, "Request for unknown route");
            self.reply(
                msg.reject(reason::ROUTE_NOT_FOUND)
                    .with_id(self.name())
                    .with_destination(caller.as_str()),
            );
            return;
        };

        let args = match msg.data() {
            Value::Null => Map::new(),
            Value::Object(args) => args.clone(),
            other => {
                let error = anyhow::anyhow!("request data must be an object, got {other}");
                self.reply(self.failure(&msg, &caller, &error));
                return;
            }
        };

        self.inner.events.dispatch(Event::Request {
            route: route_name.clone(),
            caller: caller.clone(),
        });

        let result = match AssertUnwindSafe(route.handle(&caller, args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panic_error(panic)),
        };
        if msg.uuid().is_none() {
            debug!(route = %route_name, "Request carried no uuid; result dropped");
            return;
        }
        let reply = match result {
            Ok(reply) => self.response(&msg, &caller, reply),
            Err(e) => {
                warn!(route = %route_name, caller = %caller, error = %e, "Route handler failed");
                self.failure(&msg, &caller, &e)
            }
        };
        self.reply(reply);
    }

    async fn fulfil_function_call(self, msg: Message) {
        let caller = msg.id().unwrap_or_default().to_string();

        let call: FunctionCall = match serde_json::from_value(msg.data().clone()) {
            Ok(call) => call,
            Err(e) => {
                warn!(caller = %caller, error = %e, "Malformed function call");
                self.reply(
                    msg.reject(reason::INVALID_MESSAGE)
                        .with_id(self.name())
                        .with_destination(caller.as_str()),
                );
                return;
            }
        };

        let Some(method) = self.inner.objects.method(&call.object, &call.method) else {
            info!(
                object = %call.object,
                method = %call.method,
                caller = %caller,
                "Function call for expired or unknown method"
            );
            self.reply(
                msg.reject(reason::FUNCTION_NOT_FOUND)
                    .with_id(self.name())
                    .with_destination(caller.as_str()),
            );
            return;
        };

        let result = match AssertUnwindSafe(method(call.args, call.kwargs)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panic_error(panic)),
        };
        let reply = match result {
            Ok(reply) => self.response(&msg, &caller, reply),
            Err(e) => {
                warn!(method = %call.method, caller = %caller, error = %e, "Remote method failed");
                self.failure(&msg, &caller, &e)
            }
        };
        self.reply(reply);
    }

    /// A message answering `request`, addressed to `caller`.
    fn answer(&self, kind: PayloadType, request: &Message, caller: &str) -> Message {
        let mut msg = Message::new(kind)
            .with_id(self.name())
            .with_destination(caller);
        if let Some(route) = request.route() {
            msg = msg.with_route(route);
        }
        if let Some(uuid) = request.uuid() {
            msg = msg.with_uuid(uuid);
        }
        msg
    }

    fn response(&self, request: &Message, caller: &str, reply: Reply) -> Message {
        let msg = self.answer(PayloadType::Response, request, caller);
        match reply {
            Reply::Value(value) => msg.with_data(value),
            Reply::Object(object) => {
                let payload = self.inner.objects.export(object);
                match serde_json::to_value(&payload) {
                    Ok(data) => msg.with_data(data).with_pseudo_object(true),
                    Err(e) => self.failure(request, caller, &e.into()),
                }
            }
        }
    }

    fn failure(&self, request: &Message, caller: &str, error: &anyhow::Error) -> Message {
        self.answer(PayloadType::Error, request, caller)
            .with_error(error.to_string(), format!("{error:?}"))
    }

    fn reply(&self, msg: Message) {
        if let Err(e) = self.send(msg) {
            debug!(error = %e, "Reply not sent");
        }
    }
}

/// Turn a caught handler panic into an error carrying its message.
fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("handler panicked: {message}")
}
