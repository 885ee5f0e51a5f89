use crate::server::protocol::ServerEvent;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uuid::Uuid;

pub type ConnId = Uuid;

/// Fan-out scope: either a chat channel or a user's personal notification
/// room (delivered even when the user never joined the chat room).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    Chat(String),
    User(String),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Chat(id) => write!(f, "chat_{}", id),
            RoomId::User(id) => write!(f, "user_{}", id),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    senders: HashMap<ConnId, UnboundedSender<ServerEvent>>,
    rooms: HashMap<RoomId, HashSet<ConnId>>,
    joined: HashMap<ConnId, HashSet<RoomId>>,
}

/// Per-process registry of live connections and their room memberships.
/// Constructed once by the gateway; connections are registered on connect
/// and deregistered on disconnect, no ambient global state.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnId, sender: UnboundedSender<ServerEvent>) {
        let mut inner = self.inner.lock().await;
        inner.senders.insert(conn, sender);
        inner.joined.entry(conn).or_default();
        debug!("[ROOMS] registered connection {} (total={})", conn, inner.senders.len());
    }

    /// Join a room. Membership is a set, so re-joining is a no-op; returns
    /// whether the connection was newly added.
    pub async fn join(&self, conn: ConnId, room: RoomId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.senders.contains_key(&conn) {
            return false;
        }
        inner.joined.entry(conn).or_default().insert(room.clone());
        let newly = inner.rooms.entry(room.clone()).or_default().insert(conn);
        if newly {
            debug!("[ROOMS] connection {} joined {}", conn, room);
        }
        newly
    }

    /// Deliver an event to a single connection.
    pub async fn send_to(&self, conn: ConnId, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        let dead = match inner.senders.get(&conn) {
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if dead {
            Self::drop_connection(&mut inner, conn);
        }
    }

    /// Deliver an event to every member of a room, the sender's own
    /// connections included.
    pub async fn broadcast(&self, room: &RoomId, event: &ServerEvent) {
        self.broadcast_filtered(room, None, event).await;
    }

    /// Deliver an event to every member of a room except one connection
    /// (typing relays never echo to their originator).
    pub async fn broadcast_except(&self, room: &RoomId, skip: ConnId, event: &ServerEvent) {
        self.broadcast_filtered(room, Some(skip), event).await;
    }

    async fn broadcast_filtered(&self, room: &RoomId, skip: Option<ConnId>, event: &ServerEvent) {
        let mut inner = self.inner.lock().await;
        let members: Vec<ConnId> = match inner.rooms.get(room) {
            Some(set) => set.iter().copied().collect(),
            None => return, // stale or forged room id: no-op
        };
        let mut dead = Vec::new();
        for conn in members {
            if Some(conn) == skip {
                continue;
            }
            if let Some(sender) = inner.senders.get(&conn) {
                if sender.send(event.clone()).is_err() {
                    dead.push(conn);
                }
            }
        }
        for conn in dead {
            Self::drop_connection(&mut inner, conn);
        }
    }

    /// Deregister a connection; every room it joined is left implicitly.
    pub async fn remove_connection(&self, conn: ConnId) {
        let mut inner = self.inner.lock().await;
        Self::drop_connection(&mut inner, conn);
    }

    fn drop_connection(inner: &mut RegistryInner, conn: ConnId) {
        inner.senders.remove(&conn);
        if let Some(rooms) = inner.joined.remove(&conn) {
            for room in rooms {
                if let Some(set) = inner.rooms.get_mut(&room) {
                    set.remove(&conn);
                    if set.is_empty() {
                        inner.rooms.remove(&room);
                    }
                }
            }
        }
        debug!("[ROOMS] removed connection {}", conn);
    }

    pub async fn is_member(&self, conn: ConnId, room: &RoomId) -> bool {
        let inner = self.inner.lock().await;
        inner.rooms.get(room).map_or(false, |set| set.contains(&conn))
    }

    pub async fn rooms_of(&self, conn: ConnId) -> HashSet<RoomId> {
        let inner = self.inner.lock().await;
        inner.joined.get(&conn).cloned().unwrap_or_default()
    }
}
