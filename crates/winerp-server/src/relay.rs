//! Relay — verification, duplicate-name arbitration, and forwarding.
//!
//! The [`Relay`] owns the [`ConnectionTable`] and decides, for every inbound
//! message, who receives what. It never awaits: replies are queued onto
//! each connection's writer, so the table lock is only held for the
//! duration of a single decision.

use crate::connection::{Connection, ConnectionId, ConnectionTable, Slot, Verification};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use winerp_wire::{decode, reason, Destination, Message, PayloadType};

/// Relay state shared by every connection task.
#[derive(Debug, Default)]
pub struct Relay {
    table: Mutex<ConnectionTable>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new transport connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of all active clients, sorted.
    pub fn active_names(&self) -> Vec<String> {
        self.lock().active_names()
    }

    /// Number of active clients.
    pub fn client_count(&self) -> usize {
        self.lock().active_count()
    }

    /// Slot currently occupied by a connection.
    pub fn slot(&self, id: ConnectionId) -> Option<Slot> {
        self.lock().slot(id).cloned()
    }

    /// Register a freshly accepted connection as pending verification.
    pub fn connect(&self, conn: Connection) {
        info!(conn = conn.id(), addr = %conn.addr(), "Client connected");
        self.lock().insert_pending(conn);
    }

    /// Drop a connection, promoting a held connection for the same name.
    pub fn disconnect(&self, id: ConnectionId) {
        let removal = self.lock().remove(id);
        match removal.slot {
            Some(Slot::Active(name)) => {
                info!(conn = id, name = %name, "Active client disconnected");
                if let Some(held) = removal.promoted {
                    info!(
                        conn = held.id(),
                        name = %name,
                        "On-hold client promoted to active"
                    );
                    held.send(
                        Message::new(PayloadType::Success)
                            .with_id(name)
                            .with_data(json!(reason::AUTHORIZED)),
                    );
                }
            }
            Some(Slot::OnHold(name)) => {
                info!(conn = id, name = %name, "On-hold client disconnected");
            }
            Some(Slot::Pending) => {
                info!(conn = id, "Unverified client disconnected");
            }
            None => debug!(conn = id, "Disconnect for unknown connection"),
        }
    }

    /// Decode and handle one text frame from connection `id`.
    pub fn handle_frame(&self, id: ConnectionId, text: &str) {
        match decode(text) {
            Ok(msg) => self.handle_message(id, msg),
            Err(e) => {
                warn!(conn = id, error = %e, "Rejected undecodable frame");
                let table = self.lock();
                if let Some(conn) = table.connection(id) {
                    conn.send(
                        Message::new(PayloadType::Error)
                            .with_error(reason::INVALID_MESSAGE, e.to_string()),
                    );
                }
            }
        }
    }

    /// Handle one decoded message from connection `id`.
    pub fn handle_message(&self, id: ConnectionId, msg: Message) {
        let mut table = self.lock();

        if msg.kind() == PayloadType::Verification {
            Self::verify(&mut table, id, msg);
            return;
        }

        let Some(name) = table.active_name(id).map(str::to_string) else {
            info!(conn = id, kind = %msg.kind(), "Unverified client tried to send message");
            if let Some(conn) = table.connection(id) {
                conn.send(msg.reject(reason::NOT_AUTHORIZED));
            }
            return;
        };
        let Some(sender) = table.active(&name).cloned() else {
            return;
        };
        // The verified name is authoritative for the sender field.
        let msg = msg.with_id(name.clone());

        match msg.kind() {
            PayloadType::Request => Self::forward_request(&table, &sender, &name, msg),
            PayloadType::Response | PayloadType::Error | PayloadType::FunctionCall => {
                Self::forward_reply(&table, &sender, msg)
            }
            PayloadType::Ping => {
                // Ping takes at most one destination name.
                let success = match msg.destination() {
                    None => Some(true),
                    Some(Destination::Name(dest)) => Some(table.is_active(dest)),
                    Some(Destination::Names(_)) => None,
                };
                match success {
                    Some(success) => {
                        debug!(name = %name, success, "Ping");
                        sender.send(msg.with_data(json!({ "success": success })));
                    }
                    None => {
                        debug!(name = %name, "Rejected ping with a destination list");
                        sender.send(msg.reject(reason::INVALID_MESSAGE));
                    }
                }
            }
            PayloadType::Information => Self::fan_out(&table, &name, msg),
            PayloadType::ClientCount => {
                let names = table.active_names();
                debug!(name = %name, count = names.len(), "Client listing");
                sender.send(msg.with_data(json!(names)));
            }
            PayloadType::Success | PayloadType::Verification => {
                debug!(name = %name, kind = %msg.kind(), "Ignoring client-sent message");
            }
        }
    }

    fn verify(table: &mut ConnectionTable, id: ConnectionId, msg: Message) {
        let Some(name) = msg.id().map(str::to_string) else {
            if let Some(conn) = table.connection(id) {
                conn.send(msg.reject(reason::NOT_AUTHORIZED));
            }
            return;
        };

        match table.verify(id, &name) {
            Verification::Promoted | Verification::AlreadyActive => {
                info!(conn = id, name = %name, "Client verified");
                if let Some(conn) = table.active(&name) {
                    conn.send(
                        Message::new(PayloadType::Success)
                            .with_id(name.clone())
                            .with_data(json!(reason::AUTHORIZED)),
                    );
                }
            }
            Verification::Held { displaced } => {
                info!(
                    conn = id,
                    name = %name,
                    "Connection from duplicate client has been put on hold"
                );
                // The displaced connection is back to pending and must verify again.
                if let Some(prev) = displaced {
                    warn!(conn = prev.id(), name = %name, "Previous on-hold connection displaced");
                    prev.send(Message::new(PayloadType::Error).with_error(
                        reason::NOT_AUTHORIZED,
                        "displaced from hold by a newer connection for this name",
                    ));
                }
                if let Some(conn) = table.connection(id) {
                    conn.send(msg.reject(reason::ALREADY_AUTHORIZED).without_uuid());
                }
            }
            Verification::Unknown => {
                warn!(conn = id, name = %name, "Verification from unknown connection");
            }
        }
    }

    fn forward_request(table: &ConnectionTable, sender: &Connection, name: &str, msg: Message) {
        let dest = msg.destination_name().map(str::to_string);
        match dest {
            Some(dest) if dest == name => {
                sender.send(msg.reject(reason::SAME_DESTINATION));
            }
            Some(dest) => match table.active(&dest) {
                Some(target) => {
                    debug!(from = %name, to = %dest, route = ?msg.route(), "Request forwarded");
                    target.send(msg.with_id(dest.clone()).with_destination(name));
                }
                None => {
                    sender.send(msg.reject(reason::DESTINATION_NOT_FOUND));
                }
            },
            None => {
                sender.send(msg.reject(reason::DESTINATION_NOT_FOUND));
            }
        }
    }

    fn forward_reply(table: &ConnectionTable, sender: &Connection, msg: Message) {
        match msg.destination_name().and_then(|dest| table.active(dest)) {
            Some(target) => {
                debug!(
                    from = ?msg.id(),
                    to = ?msg.destination_name(),
                    kind = %msg.kind(),
                    "Reply forwarded"
                );
                target.send(msg);
            }
            None => {
                debug!(to = ?msg.destination_name(), "Reply for disconnected requester");
                sender.send(msg.reject(reason::REQUESTER_GONE));
            }
        }
    }

    fn fan_out(table: &ConnectionTable, name: &str, msg: Message) {
        let targets: Vec<(String, Connection)> = match msg.destination() {
            None => table.active_except(name),
            Some(Destination::Names(names)) if names.is_empty() => table.active_except(name),
            Some(dest) => dest
                .names()
                .into_iter()
                .filter_map(|n| table.active(n).map(|c| (n.to_string(), c.clone())))
                .collect(),
        };
        debug!(from = %name, recipients = targets.len(), "Information fan-out");
        for (dest, conn) in targets {
            conn.send(msg.clone().with_destination(dest));
        }
    }
}
