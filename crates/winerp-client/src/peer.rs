//! A handle bound to one remote client.

use crate::client::Client;
use crate::error::ClientError;
use crate::object::Output;
use serde_json::Value;
use std::time::Duration;

/// Calls addressed to a single named client.
#[derive(Debug, Clone)]
pub struct Peer {
    client: Client,
    name: String,
}

impl Peer {
    pub(crate) fn new(client: Client, name: String) -> Self {
        Self { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, route: &str, args: Value) -> Result<Output, ClientError> {
        self.client.call(route, &self.name, args).await
    }

    pub async fn call_with_timeout(
        &self,
        route: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Output, ClientError> {
        self.client
            .call_with_timeout(route, &self.name, args, timeout)
            .await
    }

    /// Whether the peer is currently connected to the relay.
    pub async fn ping(&self) -> bool {
        self.client.ping(Some(&self.name)).await
    }

    /// Send broadcast data to this peer only.
    pub fn inform(&self, data: Value) -> Result<(), ClientError> {
        self.client.broadcast(data, &[self.name.as_str()])
    }
}
