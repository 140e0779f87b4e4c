// Core domain types shared across all Codehive crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The authenticated user principal supplied by the external identity
/// provider. Immutable for the lifetime of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Provider-assigned user id (opaque string).
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A connection's live representation within a session's participant list.
///
/// Keyed by `socket_id` inside the presence registry; the wire form sent in
/// `users-update` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    /// Identity id of the user behind this connection.
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Transport-level connection handle this entry is bound to.
    pub socket_id: Uuid,
    pub is_active: bool,
    /// Whether this user created the session.
    pub is_host: bool,
}

/// A single drawable object on a session's whiteboard.
///
/// Only `id` and `type` are interpreted server-side; every shape-specific
/// field rides along untouched so clients of different versions interoperate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardObject {
    /// Assigned by whichever party first introduces the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// A persisted collaborative session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub title: String,
    pub language: String,
    pub description: String,
    pub code: String,
    /// Identity id of the creator; the only principal allowed to end the
    /// session.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Append-only set of identity ids that ever joined via the API.
    pub participants: Vec<String>,
    pub is_active: bool,
    pub is_public: bool,
    /// Six characters from a 32-symbol alphabet, unique among active
    /// sessions.
    pub session_code: String,
}

/// Process-wide platform counters, recomputed from live presence and
/// broadcast to every connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalStats {
    pub active_sessions: u64,
    pub collaborating_users: u64,
    pub total_lines_of_code: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Highest line count seen per session, used to keep
    /// `total_lines_of_code` monotone.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub last_line_count: HashMap<Uuid, u64>,
}

/// A dated historical record of the platform counters, captured daily.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_sessions: u64,
    pub collaborating_users: u64,
    pub total_lines_of_code: u64,
}
