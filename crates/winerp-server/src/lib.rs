//! winerp relay server.
//!
//! Clients register under a unique logical name; the relay forwards
//! requests, responses, and broadcasts between those names.
//!
//! ## Architecture
//!
//! - **Server**: WebSocket listener, one reader loop and one writer task per connection
//! - **Relay**: verification, duplicate-name hand-off, and forwarding decisions
//! - **ConnectionTable**: pending / active / on-hold connection bookkeeping

pub mod config;
pub mod connection;
pub mod relay;
pub mod server;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ConnectionTable, Slot};
pub use relay::Relay;
pub use server::{Server, ServerError};
