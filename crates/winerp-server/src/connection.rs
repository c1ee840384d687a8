//! Connection table — tracks every socket the relay holds and its role.
//!
//! A connection starts as pending, becomes the active holder of a name on
//! verification, or waits on hold when that name is already taken. At most
//! one connection waits on hold per name.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use winerp_wire::Message;

/// Relay-local identifier for a transport connection.
pub type ConnectionId = u64;

/// Handle for writing to one client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            addr,
            connected_at: Utc::now(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a message for the connection's writer. Returns `false` if the
    /// writer has already gone away.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Where a connection currently sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Accepted, not yet verified.
    Pending,
    /// Active holder of the name.
    Active(String),
    /// Waiting for the name's active holder to leave.
    OnHold(String),
}

/// Outcome of a verification attempt.
#[derive(Debug)]
pub enum Verification {
    /// The connection now holds the name.
    Promoted,
    /// The name is taken; the connection waits on hold. A previous holder
    /// displaced from the hold slot is returned to pending.
    Held { displaced: Option<Connection> },
    /// The connection was already active.
    AlreadyActive,
    /// The connection id is not known to the table.
    Unknown,
}

/// Result of removing a connection.
#[derive(Debug, Default)]
pub struct Removal {
    /// The slot the connection occupied.
    pub slot: Option<Slot>,
    /// A held connection promoted into the vacated name.
    pub promoted: Option<Connection>,
}

/// Pending, active, and on-hold connections plus a reverse index.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    pending: HashMap<ConnectionId, Connection>,
    active: HashMap<String, Connection>,
    on_hold: HashMap<String, Connection>,
    slots: HashMap<ConnectionId, Slot>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection.
    pub fn insert_pending(&mut self, conn: Connection) {
        self.slots.insert(conn.id, Slot::Pending);
        self.pending.insert(conn.id, conn);
    }

    pub fn slot(&self, id: ConnectionId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Name held by an active connection.
    pub fn active_name(&self, id: ConnectionId) -> Option<&str> {
        match self.slots.get(&id) {
            Some(Slot::Active(name)) => Some(name),
            _ => None,
        }
    }

    /// Look up any connection by id, whatever its slot.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        match self.slots.get(&id)? {
            Slot::Pending => self.pending.get(&id),
            Slot::Active(name) => self.active.get(name),
            Slot::OnHold(name) => self.on_hold.get(name),
        }
    }

    pub fn active(&self, name: &str) -> Option<&Connection> {
        self.active.get(name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    /// Active names, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Active connections except the one holding `exclude`.
    pub fn active_except(&self, exclude: &str) -> Vec<(String, Connection)> {
        self.active
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .map(|(name, conn)| (name.clone(), conn.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn on_hold_count(&self) -> usize {
        self.on_hold.len()
    }

    /// Verify connection `id` under `name`.
    pub fn verify(&mut self, id: ConnectionId, name: &str) -> Verification {
        let conn = match self.slots.get(&id).cloned() {
            None => return Verification::Unknown,
            Some(Slot::Active(_)) => return Verification::AlreadyActive,
            Some(Slot::Pending) => self.pending.remove(&id),
            Some(Slot::OnHold(held_name)) => self.on_hold.remove(&held_name),
        };
        let Some(conn) = conn else {
            return Verification::Unknown;
        };

        if self.active.contains_key(name) {
            let displaced = self.on_hold.insert(name.to_string(), conn);
            if let Some(prev) = &displaced {
                self.slots.insert(prev.id, Slot::Pending);
                self.pending.insert(prev.id, prev.clone());
            }
            self.slots.insert(id, Slot::OnHold(name.to_string()));
            Verification::Held { displaced }
        } else {
            self.slots.insert(id, Slot::Active(name.to_string()));
            self.active.insert(name.to_string(), conn);
            Verification::Promoted
        }
    }

    /// Forget connection `id`. If it was the active holder of a name with a
    /// connection on hold, the held connection is promoted.
    pub fn remove(&mut self, id: ConnectionId) -> Removal {
        let Some(slot) = self.slots.remove(&id) else {
            return Removal::default();
        };

        let promoted = match &slot {
            Slot::Pending => {
                self.pending.remove(&id);
                None
            }
            Slot::OnHold(name) => {
                self.on_hold.remove(name);
                None
            }
            Slot::Active(name) => {
                self.active.remove(name);
                let held = self.on_hold.remove(name);
                if let Some(held) = &held {
                    self.slots.insert(held.id, Slot::Active(name.clone()));
                    self.active.insert(name.clone(), held.clone());
                }
                held
            }
        };

        Removal {
            slot: Some(slot),
            promoted,
        }
    }
}
