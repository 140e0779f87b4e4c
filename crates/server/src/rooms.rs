// Session broadcast hub: purely in-memory routing of server events to
// connections, grouped into per-session multicast rooms.
//
// A connection belongs to at most one room at a time in practice, but the
// hub does not enforce it: joining a new room does not leave the previous
// one. Callers issue explicit leaves (switching between editor and
// whiteboard views intentionally preserves membership).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use codehive_common::protocol::events::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::metrics;

#[derive(Debug, Clone, Default)]
pub struct RoomHub {
    state: Arc<RwLock<RoomState>>,
}

#[derive(Debug, Default)]
struct RoomState {
    /// Outbound channel per registered connection.
    connections: HashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>,
    /// Member connections per session room.
    rooms: HashMap<Uuid, HashSet<Uuid>>,
}

impl RoomHub {
    /// Register a connection's outbound channel. Must be called before the
    /// connection can join rooms or receive events.
    pub async fn register(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<ServerEvent>) {
        let mut guard = self.state.write().await;
        guard.connections.insert(connection_id, sender);
    }

    /// Drop a connection and remove it from every room.
    pub async fn unregister(&self, connection_id: Uuid) {
        let mut guard = self.state.write().await;
        guard.connections.remove(&connection_id);
        guard.rooms.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    pub async fn join(&self, connection_id: Uuid, session_id: Uuid) {
        let mut guard = self.state.write().await;
        guard.rooms.entry(session_id).or_default().insert(connection_id);
    }

    pub async fn leave(&self, connection_id: Uuid, session_id: Uuid) {
        let mut guard = self.state.write().await;
        if let Some(members) = guard.rooms.get_mut(&session_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                guard.rooms.remove(&session_id);
            }
        }
    }

    /// Fan an event out to a session room, optionally excluding the sender.
    /// Fire-and-forget: a closed receiver is skipped, not retried. Returns
    /// the delivery count.
    pub async fn broadcast(
        &self,
        session_id: Uuid,
        event: ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let recipients = {
            let guard = self.state.read().await;
            let Some(members) = guard.rooms.get(&session_id) else {
                return 0;
            };
            members
                .iter()
                .filter(|member| Some(**member) != exclude)
                .filter_map(|member| guard.connections.get(member).cloned())
                .collect::<Vec<_>>()
        };

        let mut delivered = 0;
        for recipient in recipients {
            if recipient.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        metrics::add_broadcast_fanout(delivered as u64);
        delivered
    }

    /// Deliver an event to every registered connection, in or out of rooms.
    pub async fn broadcast_to_all(&self, event: ServerEvent) -> usize {
        let recipients = {
            let guard = self.state.read().await;
            guard.connections.values().cloned().collect::<Vec<_>>()
        };

        let mut delivered = 0;
        for recipient in recipients {
            if recipient.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        metrics::add_broadcast_fanout(delivered as u64);
        delivered
    }

    /// Deliver an event to a single connection. Returns false when the
    /// connection is unknown or its channel is closed.
    pub async fn send_to(&self, connection_id: Uuid, event: ServerEvent) -> bool {
        let sender = {
            let guard = self.state.read().await;
            guard.connections.get(&connection_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Member connections of a room (for diagnostics and tests).
    pub async fn members(&self, session_id: Uuid) -> Vec<Uuid> {
        let guard = self.state.read().await;
        guard
            .rooms
            .get(&session_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}
