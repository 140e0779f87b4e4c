// Presence registry: who is connected to which session, keyed by
// transport connection.
//
// Invariants:
// - at most one presence entry per connection within a session;
// - an identity may hold entries on several connections of the same session
//   (multiple tabs/devices), but a resync on the same identity replaces its
//   previous entry instead of duplicating it;
// - the membership set tracks (identity, session) pairs and feeds the
//   platform counters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codehive_common::types::PresenceUser;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Minimum spacing between authenticate attempts for the same
/// (identity, session, connection) triple.
const AUTH_THROTTLE_WINDOW: Duration = Duration::from_secs(5);
/// Throttle entries older than this are purged lazily on each attempt.
const AUTH_THROTTLE_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    state: Arc<RwLock<PresenceState>>,
}

#[derive(Debug, Default)]
struct PresenceState {
    /// Presence roster per session, ordered by join time.
    sessions: HashMap<Uuid, Vec<PresenceUser>>,
    /// (identity id, session id) pairs currently considered "in" a session.
    memberships: HashSet<(String, Uuid)>,
    /// Last authenticate attempt per (identity, session, connection).
    auth_attempts: HashMap<(String, Uuid, Uuid), Instant>,
}

impl PresenceRegistry {
    /// Record an authenticate attempt. Returns false when the triple is
    /// still inside the cooldown window (the caller drops the event
    /// silently — throttled, not rejected).
    pub async fn begin_authenticate(
        &self,
        identity_id: &str,
        session_id: Uuid,
        connection_id: Uuid,
    ) -> bool {
        self.begin_authenticate_at(identity_id, session_id, connection_id, Instant::now()).await
    }

    /// Like `begin_authenticate` but with a specific timestamp (for testing).
    async fn begin_authenticate_at(
        &self,
        identity_id: &str,
        session_id: Uuid,
        connection_id: Uuid,
        now: Instant,
    ) -> bool {
        let mut guard = self.state.write().await;
        guard
            .auth_attempts
            .retain(|_, last_seen| now.duration_since(*last_seen) < AUTH_THROTTLE_RETENTION);

        let key = (identity_id.to_string(), session_id, connection_id);
        if let Some(last_seen) = guard.auth_attempts.get(&key) {
            if now.duration_since(*last_seen) < AUTH_THROTTLE_WINDOW {
                return false;
            }
        }
        guard.auth_attempts.insert(key, now);
        true
    }

    /// Add (or on resync, replace) a presence entry and return the updated
    /// roster for the session.
    pub async fn join(&self, session_id: Uuid, user: PresenceUser) -> Vec<PresenceUser> {
        let mut guard = self.state.write().await;
        let membership = (user.id.clone(), session_id);
        let roster = guard.sessions.entry(session_id).or_default();

        if roster.iter().any(|entry| entry.id == user.id) {
            // Resync: drop the stale entry for this identity, insert at the
            // new connection.
            roster.retain(|entry| entry.id != user.id);
        }
        roster.push(user);
        let users = roster.clone();
        guard.memberships.insert(membership);
        users
    }

    /// Explicit leave. Locates the entry by identity id, falling back to the
    /// connection handle when no identity is supplied; removes the
    /// membership pair unconditionally. Returns the remaining roster.
    pub async fn leave(
        &self,
        session_id: Uuid,
        identity_id: Option<&str>,
        connection_id: Uuid,
    ) -> Vec<PresenceUser> {
        let mut guard = self.state.write().await;
        let Some(roster) = guard.sessions.get_mut(&session_id) else {
            return Vec::new();
        };

        let departed = match identity_id {
            Some(id) => roster.iter().position(|entry| entry.id == id),
            None => roster.iter().position(|entry| entry.socket_id == connection_id),
        };

        let mut departed_identity = None;
        if let Some(index) = departed {
            departed_identity = Some(roster.remove(index).id);
        }

        let users = roster.clone();
        if users.is_empty() {
            guard.sessions.remove(&session_id);
        }
        if let Some(identity) = departed_identity {
            guard.memberships.remove(&(identity, session_id));
        }
        users
    }

    /// Disconnect cleanup. Removes the entry bound to the connection; the
    /// membership pair survives while the identity still has another entry
    /// in the session (other tab/device). Returns the remaining roster, or
    /// None when the connection had no entry in the session.
    pub async fn disconnect(
        &self,
        session_id: Uuid,
        connection_id: Uuid,
    ) -> Option<Vec<PresenceUser>> {
        let mut guard = self.state.write().await;
        let roster = guard.sessions.get_mut(&session_id)?;

        let index = roster.iter().position(|entry| entry.socket_id == connection_id)?;
        let departed = roster.remove(index);
        let identity_remains = roster.iter().any(|entry| entry.id == departed.id);

        let users = roster.clone();
        if users.is_empty() {
            guard.sessions.remove(&session_id);
        }
        if !identity_remains {
            guard.memberships.remove(&(departed.id, session_id));
        }
        Some(users)
    }

    /// Current roster for a session (empty if unknown).
    pub async fn users(&self, session_id: Uuid) -> Vec<PresenceUser> {
        self.state.read().await.sessions.get(&session_id).cloned().unwrap_or_default()
    }

    /// First connection found for an identity across all sessions.
    pub async fn find_user_socket(&self, identity_id: &str) -> Option<Uuid> {
        let guard = self.state.read().await;
        guard
            .sessions
            .values()
            .flat_map(|roster| roster.iter())
            .find(|entry| entry.id == identity_id)
            .map(|entry| entry.socket_id)
    }

    /// Count of distinct sessions with at least one member.
    pub async fn active_session_count(&self) -> u64 {
        let guard = self.state.read().await;
        let sessions: HashSet<Uuid> =
            guard.memberships.iter().map(|(_, session_id)| *session_id).collect();
        sessions.len() as u64
    }

    /// Size of the membership set.
    pub async fn member_count(&self) -> u64 {
        self.state.read().await.memberships.len() as u64
    }

    /// Whether the membership set contains the pair (for tests and
    /// diagnostics).
    pub async fn is_member(&self, identity_id: &str, session_id: Uuid) -> bool {
        self.state.read().await.memberships.contains(&(identity_id.to_string(), session_id))
    }
}
