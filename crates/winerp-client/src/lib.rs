//! winerp client.
//!
//! A [`Client`] connects to a winerp relay under a unique logical name,
//! serves named routes to other clients, and calls theirs. Handlers may
//! return a [`RemoteObject`], which the caller receives as an
//! [`ObjectProxy`] whose methods run back in the producing process.
//!
//! ```no_run
//! use serde_json::{json, Map, Value};
//! use winerp_client::{Client, ClientConfig, Reply};
//!
//! # async fn demo() -> Result<(), winerp_client::ClientError> {
//! let client = Client::new(ClientConfig::new("calculator"));
//! client.add_route("sum", |_caller: String, args: Map<String, Value>| async move {
//!     let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
//!     let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
//!     Ok(Reply::from(json!(a + b)))
//! })?;
//! client.start().await?;
//! client.wait_until_ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod object;
pub mod peer;
pub mod routes;

pub use client::{Client, ConnectionState};
pub use config::ClientConfig;
pub use correlation::{Correlator, Pending};
pub use error::ClientError;
pub use events::{Event, EventHub, EventKind};
pub use object::{Field, ObjectProxy, ObjectRegistry, Output, RemoteObject, Snapshot, Transferable};
pub use peer::Peer;
pub use routes::{Reply, Route, RouteRegistry};
pub use winerp_wire as wire;
