//! Server — WebSocket listener for the winerp relay.
//!
//! A [`Server`] binds a TCP listener, upgrades every accepted stream to a
//! WebSocket, and hands each connection to the shared [`Relay`]. Each
//! connection gets a reader loop (frames in receipt order) and a writer
//! task draining its outbound queue.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::relay::Relay;

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use winerp_wire::{encode, Message};

/// Errors from the relay server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay's network endpoint.
pub struct Server {
    config: ServerConfig,
    relay: Arc<Relay>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the configured address and start accepting connections.
    pub async fn start(
        config: ServerConfig,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        info!("winerp: relay listening on ws://{}", local_addr);

        let server = Arc::new(Self {
            config,
            relay: Arc::new(Relay::new()),
            local_addr,
        });

        let server_clone = Arc::clone(&server);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, server_clone).await;
        });

        Ok((server, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URI clients should connect to.
    pub fn uri(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);
        ws_config
    }

    async fn accept_loop(listener: TcpListener, server: Arc<Server>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("winerp: accepted connection from {}", addr);
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            debug!("winerp: connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("winerp: accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(self.ws_config())).await?;
        let (mut sink, mut source) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = self.relay.next_connection_id();
        self.relay.connect(Connection::new(id, addr, tx));

        // Ends once the relay drops the connection's sender.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match encode(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("winerp: failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!("winerp: write to {} failed: {}", addr, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = loop {
            match source.next().await {
                Some(Ok(WsMessage::Text(text))) => self.relay.handle_frame(id, &text),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.relay.handle_frame(id, text),
                    Err(_) => warn!("winerp: dropped non-UTF-8 binary frame from {}", addr),
                },
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(ServerError::WebSocket(e)),
            }
        };

        self.relay.disconnect(id);
        let _ = writer.await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winerp_wire::{decode, PayloadType};

    #[tokio::test]
    async fn test_verification_over_websocket() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let (server, _task) = Server::start(config).await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(server.uri()).await.unwrap();
        let verify = Message::new(PayloadType::Verification)
            .with_id("alpha")
            .with_uuid("v1");
        ws.send(WsMessage::Text(encode(&verify).unwrap()))
            .await
            .unwrap();

        let reply = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => decode(&text).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        };
        assert_eq!(reply.kind(), PayloadType::Success);
        assert_eq!(server.relay().active_names(), vec!["alpha"]);

        ws.close(None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(server.relay().client_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_before_verification() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let (server, _task) = Server::start(config).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(server.uri()).await.unwrap();

        ws.send(WsMessage::Text("{}".to_string())).await.unwrap();
        let reply = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => decode(&text).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        };
        assert_eq!(reply.kind(), PayloadType::Error);
        assert_eq!(reply.error(), Some(winerp_wire::reason::INVALID_MESSAGE));
    }
}
