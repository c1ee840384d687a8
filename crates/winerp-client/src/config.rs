//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use winerp_wire::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT};

/// Serde helper for `Duration` as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (dur.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Logical name, unique among active clients on the relay.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Reconnect automatically when the socket closes.
    pub reconnect: bool,
    /// Fixed wait between reconnection attempts.
    #[serde(rename = "reconnect_interval_ms", with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Deadline for `call` and `ping` when none is given.
    #[serde(rename = "default_timeout_ms", with = "duration_ms")]
    pub default_timeout: Duration,
    /// Deadline for remote object method calls.
    #[serde(rename = "function_call_timeout_ms", with = "duration_ms")]
    pub function_call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            reconnect: true,
            reconnect_interval: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            default_timeout: Duration::from_secs(60),
            function_call_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Defaults with the given logical name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Relay URI.
    pub fn uri(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}
