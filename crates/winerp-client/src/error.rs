//! Client error taxonomy.

use std::time::Duration;
use thiserror::Error;
use winerp_wire::{reason, Message, WireError};

/// Errors surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client has not been started, or its socket is closed.
    #[error("Client has not been started or has disconnected")]
    NotConnected,

    /// `start()` was called while a connection is already open.
    #[error("WebSocket is already connected")]
    AlreadyConnected,

    /// The relay has not (yet) verified this client's name.
    #[error("Client is not authorized")]
    NotAuthorized,

    /// Another connection holds this name; requests wait until it leaves.
    #[error("Client is on hold: another client with the same name is active")]
    OnHold,

    /// No reply arrived before the caller's deadline.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The socket closed while the reply was outstanding.
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// A reply arrived for a uuid with no outstanding slot.
    #[error("No pending request for uuid {0}")]
    UnknownCorrelation(String),

    /// A slot with this uuid is already outstanding.
    #[error("Duplicate correlation id {0}")]
    DuplicateCorrelation(String),

    /// A reply-shaped message arrived without a uuid.
    #[error("Message is missing its correlation id")]
    MissingCorrelationId,

    /// The peer's handler failed.
    #[error("Remote error: {message}")]
    Remote { message: String, traceback: String },

    /// The peer has no handler for the route.
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    /// The relay has no active client with the requested name.
    #[error("Destination not found")]
    DestinationNotFound,

    /// The request was addressed to this client itself.
    #[error("Source and destination are the same")]
    SameDestination,

    #[error("Route already registered: {0}")]
    RouteExists(String),

    #[error("Route not registered: {0}")]
    RouteNotRegistered(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// The remote object does not export this method.
    #[error("Remote object has no method {0}")]
    UnknownMethod(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Classify an `error` message received for an outstanding request.
    pub fn from_reply(msg: &Message) -> Self {
        let text = msg.error_text().unwrap_or_default();
        match text {
            reason::ROUTE_NOT_FOUND => Self::RouteNotFound(msg.route().unwrap_or_default().to_string()),
            reason::DESTINATION_NOT_FOUND => Self::DestinationNotFound,
            reason::SAME_DESTINATION => Self::SameDestination,
            reason::NOT_AUTHORIZED => Self::NotAuthorized,
            _ => Self::Remote {
                message: text.to_string(),
                traceback: msg.traceback().unwrap_or_default().to_string(),
            },
        }
    }

    /// Whether the error came from the peer or the relay rather than locally.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::Remote { .. }
                | Self::RouteNotFound(_)
                | Self::DestinationNotFound
                | Self::SameDestination
        )
    }
}
