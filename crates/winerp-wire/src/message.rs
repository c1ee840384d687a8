//! Message envelope and payload type.
//!
//! A [`Message`] is a flat string-keyed record. Only `type` is mandatory;
//! absent optional fields are skipped on encode and read back as `None`.
//! [`PayloadType`] crosses the wire as its ordinal.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown payload type: {0}")]
    UnknownPayloadType(u64),
}

/// Fixed reason strings exchanged on `error` and `success` messages.
pub mod reason {
    /// Success payload sent after verification or hold promotion.
    pub const AUTHORIZED: &str = "Authorized.";
    /// The name is already held by an active connection.
    pub const ALREADY_AUTHORIZED: &str = "Already authorized.";
    /// The sending connection has not completed verification.
    pub const NOT_AUTHORIZED: &str = "Not authorized.";
    /// A request addressed to its own sender.
    pub const SAME_DESTINATION: &str = "Source and destination are the same.";
    /// The addressed name has no active connection.
    pub const DESTINATION_NOT_FOUND: &str = "Destination not found.";
    /// A reply whose addressee disconnected before it arrived.
    pub const REQUESTER_GONE: &str = "The data requester is no longer connected";
    /// The peer has no handler registered under the requested route.
    pub const ROUTE_NOT_FOUND: &str = "Route not found";
    /// The addressed remote object method expired or never existed.
    pub const FUNCTION_NOT_FOUND: &str =
        "The called function has either expired or has never been registered";
    /// The frame could not be decoded as a message.
    pub const INVALID_MESSAGE: &str = "Invalid message.";
}

/// The kind of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Verification accepted (or hold promoted).
    Success,
    /// Name registration handshake.
    Verification,
    /// Route invocation.
    Request,
    /// Reply to a request or function call.
    Response,
    /// Failure reply or relay rejection.
    Error,
    /// Liveness check answered by the relay.
    Ping,
    /// Fire-and-forget broadcast.
    Information,
    /// Invocation of a remote object method.
    FunctionCall,
    /// Listing of active client names.
    ClientCount,
}

impl PayloadType {
    /// The integer that represents this type on the wire.
    pub fn ordinal(self) -> u64 {
        match self {
            Self::Success => 0,
            Self::Verification => 1,
            Self::Request => 2,
            Self::Response => 3,
            Self::Error => 4,
            Self::Ping => 5,
            Self::Information => 6,
            Self::FunctionCall => 7,
            Self::ClientCount => 9,
        }
    }

    /// Map a wire ordinal back to its type.
    pub fn from_ordinal(ordinal: u64) -> Result<Self, WireError> {
        Ok(match ordinal {
            0 => Self::Success,
            1 => Self::Verification,
            2 => Self::Request,
            3 => Self::Response,
            4 => Self::Error,
            5 => Self::Ping,
            6 => Self::Information,
            7 => Self::FunctionCall,
            9 => Self::ClientCount,
            other => return Err(WireError::UnknownPayloadType(other)),
        })
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Verification => "verification",
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Information => "information",
            Self::FunctionCall => "function_call",
            Self::ClientCount => "client_count",
        };
        f.write_str(name)
    }
}

impl Serialize for PayloadType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.ordinal())
    }
}

impl<'de> Deserialize<'de> for PayloadType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct OrdinalVisitor;

        impl Visitor<'_> for OrdinalVisitor {
            type Value = PayloadType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a payload type ordinal")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PayloadType, E> {
                PayloadType::from_ordinal(v).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PayloadType, E> {
                let v = u64::try_from(v).map_err(|_| E::custom(format!("negative ordinal {v}")))?;
                self.visit_u64(v)
            }
        }

        d.deserialize_u64(OrdinalVisitor)
    }
}

/// Recipient(s) of a message.
///
/// Point-to-point messages name a single client. Broadcasts carry a list;
/// an empty list (or an absent destination) means every other active client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Destination {
    Name(String),
    Names(Vec<String>),
}

impl Destination {
    /// The single recipient name, if this is a point-to-point destination.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Names(_) => None,
        }
    }

    /// All recipient names in order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Name(name) => vec![name.as_str()],
            Self::Names(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Vec<String>> for Destination {
    fn from(names: Vec<String>) -> Self {
        Self::Names(names)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A wire message.
///
/// Messages are immutable once built; the `with_*` methods consume the
/// message and return a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: PayloadType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pseudo_object: bool,
}

impl Message {
    /// Create an empty message of the given type.
    pub fn new(kind: PayloadType) -> Self {
        Self {
            kind,
            id: None,
            destination: None,
            route: None,
            uuid: None,
            data: Value::Null,
            error: None,
            traceback: None,
            pseudo_object: false,
        }
    }

    pub fn kind(&self) -> PayloadType {
        self.kind
    }

    /// Name of the sender (or, on a forwarded request, of the recipient).
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// The destination if it is a single name.
    pub fn destination_name(&self) -> Option<&str> {
        self.destination.as_ref().and_then(Destination::as_name)
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// The payload, `Value::Null` when absent.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    /// Whether `data` carries a serialized remote object.
    pub fn is_pseudo_object(&self) -> bool {
        self.pseudo_object
    }

    /// Failure text: the `error` field, falling back to a string `data`.
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_deref().or_else(|| self.data.as_str())
    }

    /// Consume the message and take ownership of its payload.
    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn with_kind(mut self, kind: PayloadType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn without_destination(mut self) -> Self {
        self.destination = None;
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn without_uuid(mut self) -> Self {
        self.uuid = None;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the failure text and its trace.
    pub fn with_error(mut self, error: impl Into<String>, traceback: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_pseudo_object(mut self, pseudo_object: bool) -> Self {
        self.pseudo_object = pseudo_object;
        self
    }

    /// An `error` message answering this one: same uuid and route, the
    /// fixed `reason` as both error text and trace.
    pub fn reject(&self, reason: &str) -> Message {
        let mut reply = Message::new(PayloadType::Error).with_error(reason, reason);
        reply.id = self.id.clone();
        reply.route = self.route.clone();
        reply.uuid = self.uuid.clone();
        reply
    }
}

/// Encode a message into a single text frame.
pub fn encode(msg: &Message) -> Result<String, WireError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode a text frame. Fails if `type` is absent or unknown.
pub fn decode(text: &str) -> Result<Message, WireError> {
    Ok(serde_json::from_str(text)?)
}
