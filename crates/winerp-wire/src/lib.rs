//! winerp wire protocol.
//!
//! Every process in a winerp mesh speaks the same vocabulary: a flat JSON
//! record per WebSocket text frame, tagged with an integer [`PayloadType`].
//!
//! ## Architecture
//!
//! - **Message**: the immutable envelope exchanged between clients and the relay
//! - **PayloadType**: closed, ordinal-stable set of message kinds
//! - **Destination**: a single recipient name or a broadcast target list
//! - **FunctionCall / ObjectPayload**: `data` shapes used by remote objects

pub mod message;
pub mod payload;

pub use message::{decode, encode, reason, Destination, Message, PayloadType, WireError};
pub use payload::{FunctionCall, ObjectPayload};

/// Default relay port.
pub const DEFAULT_PORT: u16 = 13254;

/// Default maximum inbound frame size (2 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
