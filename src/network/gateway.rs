//! Connection Gateway
//!
//! The connection table: one outbound queue per authenticated identity.
//! Everything the server says to a client goes through here. Sends never
//! wait: a full queue drops the frame, and the client recovers through a
//! desync and a resync request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::game::state::UserId;
use crate::network::protocol::{ServerEnvelope, ServerMessage};
use crate::session::session::Session;

/// Identifies one physical connection of a user.
pub type ConnectionId = u64;

/// Close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: server going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code: server at capacity, retry later.
pub const CLOSE_TRY_AGAIN: u16 = 1013;
/// Close code: authentication failed.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code: another connection took over this identity.
pub const CLOSE_REPLACED: u16 = 4002;
/// Close code: the session ended.
pub const CLOSE_SESSION_ENDED: u16 = 4003;
/// Close code: idle too long.
pub const CLOSE_IDLE: u16 = 4004;

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized envelope.
    Frame(String),
    /// Close the socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

struct ConnectionEntry {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

/// Identity to connection table.
pub struct ConnectionGateway {
    connections: RwLock<HashMap<UserId, ConnectionEntry>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionGateway {
    /// Create an empty gateway.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Bind a new connection to `user`. An existing connection for the same
    /// identity is told to close and replaced.
    pub async fn register(&self, user: &UserId) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self
            .connections
            .write()
            .await
            .insert(user.clone(), ConnectionEntry { id, sender });

        if let Some(old) = previous {
            info!(user = %user, old = old.id, new = id, "Connection replaced");
            let _ = old.sender.try_send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced by a newer connection".into(),
            });
        }

        (id, receiver)
    }

    /// Remove `user`'s entry if it still belongs to connection `id`.
    /// Returns false when a newer connection has taken over.
    pub async fn unregister(&self, user: &UserId, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user) {
            Some(entry) if entry.id == id => {
                connections.remove(user);
                true
            }
            _ => false,
        }
    }

    /// Does `user` have a live connection?
    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn encode(envelope: &ServerEnvelope) -> Option<String> {
        match envelope.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to encode server message: {}", e);
                None
            }
        }
    }

    fn deliver(user: &UserId, entry: &ConnectionEntry, item: Outbound) -> bool {
        match entry.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user = %user, "Outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user = %user, "Outbound queue closed");
                false
            }
        }
    }

    /// Push a message to one identity.
    pub async fn send(&self, user: &UserId, message: ServerMessage) -> bool {
        let Some(frame) = Self::encode(&ServerEnvelope::push(message, self.next_seq())) else {
            return false;
        };
        let connections = self.connections.read().await;
        connections
            .get(user)
            .map_or(false, |entry| Self::deliver(user, entry, Outbound::Frame(frame)))
    }

    /// Reply to request `req_seq` from `user`.
    pub async fn reply(&self, user: &UserId, req_seq: u64, message: ServerMessage) -> bool {
        let Some(frame) = Self::encode(&ServerEnvelope::reply(message, self.next_seq(), req_seq)) else {
            return false;
        };
        let connections = self.connections.read().await;
        connections
            .get(user)
            .map_or(false, |entry| Self::deliver(user, entry, Outbound::Frame(frame)))
    }

    /// Push a message to every connected member of `session`.
    pub async fn broadcast(&self, session: &Session, message: ServerMessage, exclude: Option<&UserId>) {
        let Some(frame) = Self::encode(&ServerEnvelope::push(message, self.next_seq())) else {
            return;
        };
        let connections = self.connections.read().await;
        for player in session.players() {
            if exclude == Some(&player.user_id) {
                continue;
            }
            if let Some(entry) = connections.get(&player.user_id) {
                Self::deliver(&player.user_id, entry, Outbound::Frame(frame.clone()));
            }
        }
    }

    /// Push a message to every connection.
    pub async fn broadcast_all(&self, message: ServerMessage) {
        let Some(frame) = Self::encode(&ServerEnvelope::push(message, self.next_seq())) else {
            return;
        };
        let connections = self.connections.read().await;
        for (user, entry) in connections.iter() {
            Self::deliver(user, entry, Outbound::Frame(frame.clone()));
        }
    }

    /// Tell `user`'s connection to close and drop it from the table.
    pub async fn close(&self, user: &UserId, code: u16, reason: &str) {
        if let Some(entry) = self.connections.write().await.remove(user) {
            Self::deliver(user, &entry, Outbound::Close { code, reason: reason.to_string() });
        }
    }
}
