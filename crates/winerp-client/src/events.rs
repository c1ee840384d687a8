//! Event hub: one persistent handler per event kind plus one-shot waiters.

use crate::error::ClientError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lifecycle and traffic events a client emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The socket opened; verification not yet acknowledged.
    Connect,
    /// The relay verified this client's name.
    Ready,
    Disconnect,
    /// A route handler was started for an incoming request.
    Request,
    /// A reply resolved an outstanding call.
    Response,
    /// Broadcast data arrived.
    Information,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Connect,
        EventKind::Ready,
        EventKind::Disconnect,
        EventKind::Request,
        EventKind::Response,
        EventKind::Information,
        EventKind::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "winerp_connect",
            Self::Ready => "winerp_ready",
            Self::Disconnect => "winerp_disconnect",
            Self::Request => "winerp_request",
            Self::Response => "winerp_response",
            Self::Information => "winerp_information",
            Self::Error => "winerp_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = ClientError;

    /// Accepts `winerp_ready` as well as `on_winerp_ready`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("on_").unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ClientError::UnknownEvent(s.to_string()))
    }
}

/// An emitted event with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect,
    Ready,
    Disconnect,
    Request { route: String, caller: String },
    Response { uuid: String },
    Information { data: Value, sender: Option<String> },
    Error { message: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Ready => EventKind::Ready,
            Self::Disconnect => EventKind::Disconnect,
            Self::Request { .. } => EventKind::Request,
            Self::Response { .. } => EventKind::Response,
            Self::Information { .. } => EventKind::Information,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Persistent event handler.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct HubInner {
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
    waiters: Mutex<HashMap<EventKind, Vec<oneshot::Sender<Event>>>>,
}

/// Dispatches events to handlers and waiters. Clones share state.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<EventKind> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        f.debug_struct("EventHub").field("handlers", &handlers).finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the persistent handler for `kind`, replacing any previous one.
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, handler)
            .is_some();
        debug!(event = %kind, replaced, "Event handler registered");
    }

    /// [`EventHub::on`] by event name, e.g. `"winerp_ready"` or `"on_winerp_ready"`.
    pub fn on_named<F, Fut>(&self, name: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let kind: EventKind = name.parse()?;
        self.on(kind, handler);
        Ok(())
    }

    /// Remove the persistent handler for `kind`. Returns whether one existed.
    pub fn off(&self, kind: EventKind) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind)
            .is_some()
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&kind)
    }

    /// Wait for the next `kind` event. `None` waits indefinitely.
    pub async fn wait_for(
        &self,
        kind: EventKind,
        timeout: Option<Duration>,
    ) -> Result<Event, ClientError> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            let mut waiters = self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner());
            let list = waiters.entry(kind).or_default();
            list.retain(|tx| !tx.is_closed());
            list.push(tx);
            rx
        };

        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| ClientError::Timeout(timeout))?,
            None => rx.await,
        };
        received.map_err(|_| ClientError::ConnectionLost)
    }

    /// Number of live one-shot waiters for `kind`.
    pub fn waiter_count(&self, kind: EventKind) -> usize {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Resolve every current waiter for the event's kind and schedule its
    /// persistent handler. Must be called from within a Tokio runtime.
    pub fn dispatch(&self, event: Event) {
        let kind = event.kind();

        let waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(event.clone());
        }

        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned();
        let Some(handler) = handler else {
            return;
        };

        let hub = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handler(event).await {
                warn!(event = %kind, error = %e, "Event handler failed");
                if kind != EventKind::Error {
                    hub.dispatch(Event::Error {
                        message: e.to_string(),
                    });
                }
            }
        });
    }
}
