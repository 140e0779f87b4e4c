// Wire events for the codehive realtime protocol.
//
// One JSON frame per event, tagged by `type` using the platform's
// kebab-case event names. Client and server frames are separate enums
// because several events (chat-message, whiteboard-state) carry different
// payloads per direction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BoardObject, GlobalStats, Identity, PresenceUser};

/// All client -> server event frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join a session with a verified identity; creates a presence entry.
    Authenticate { session_id: Uuid, user: Identity },

    /// Room-only join (no presence entry), e.g. when switching views.
    JoinSession { session_id: Uuid },

    /// Explicitly leave a session.
    LeaveSession {
        session_id: Uuid,
        #[serde(default)]
        user_id: Option<String>,
    },

    /// The shared code document changed.
    CodeChange { content: String },

    /// A batch of whiteboard objects was drawn.
    WhiteboardDraw { objects: Vec<BoardObject> },

    /// A single whiteboard object was added or moved.
    WhiteboardUpdate { object: BoardObject },

    /// Wipe the session whiteboard.
    WhiteboardClear,

    /// Ask the server (or failing that, a peer) for current whiteboard state.
    WhiteboardRequestState { session_id: Uuid },

    /// A peer supplying whiteboard state for a specific requester.
    WhiteboardStateResponse {
        session_id: Uuid,
        objects: Vec<BoardObject>,
        target_socket_id: Uuid,
    },

    /// Chat line; the server assigns the timestamp.
    ChatMessage { text: String },

    /// Opaque challenge payloads, relayed to the rest of the session.
    ChallengeSelected { payload: serde_json::Value },
    ChallengeClosed { payload: serde_json::Value },

    /// End the session; only honored for the session creator.
    EndSession { session_id: Uuid, user_id: String },

    /// Broadcast an exit notice without an ownership check.
    ForceExitSession {
        session_id: Uuid,
        message: String,
        ended_by: String,
    },

    /// Re-request the presence roster after a suspected desync.
    GetUsers { session_id: Uuid },

    /// Point lookup of a user's connection across all sessions.
    FindUserSocket { user_id: String },

    /// Ask for an immediate `global-stats` push.
    RequestGlobalStats,

    /// Bootstrap peer-to-peer video: fan an opaque offer out to the session.
    RequestPeerConnections { payload: serde_json::Value },

    /// Bootstrap peer-to-peer video: deliver an opaque frame to one peer.
    PeerSignal {
        target_socket_id: Uuid,
        payload: serde_json::Value,
    },
}

/// All server -> client event frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Private acknowledgment of a successful authenticate.
    JoinedSession {
        session_id: Uuid,
        users: Vec<PresenceUser>,
    },

    /// Private acknowledgment of a room-only join.
    JoinedSessionRoom { session_id: Uuid },

    /// Current presence roster, broadcast to the session.
    UsersUpdate { users: Vec<PresenceUser> },

    /// Code document change, enriched with the sender's identity when the
    /// sender authenticated (room-only joins have none).
    CodeUpdate {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
    },

    WhiteboardDraw { objects: Vec<BoardObject> },
    WhiteboardUpdate { object: BoardObject },
    WhiteboardClear,

    /// Whiteboard state for a late joiner. `source` is `"server-stored"`
    /// when served from the in-memory store, absent when relayed from a peer.
    WhiteboardState {
        session_id: Uuid,
        objects: Vec<BoardObject>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },

    /// Ask the session's peers to supply whiteboard state for a requester.
    WhiteboardStateRequest {
        session_id: Uuid,
        requester_socket_id: Uuid,
    },

    /// Chat line with server-assigned epoch-millisecond timestamp.
    ChatMessage {
        text: String,
        timestamp: i64,
        user: Identity,
    },

    /// The session was ended by its creator.
    SessionEnded {
        session_id: Uuid,
        message: String,
        ended_by: String,
    },

    ForceExitSession {
        session_id: Uuid,
        message: String,
        ended_by: String,
    },

    ChallengeSelected { payload: serde_json::Value },
    ChallengeClosed { payload: serde_json::Value },

    /// Platform-wide counters, broadcast to every connection.
    GlobalStats(GlobalStats),

    /// Response to `find-user-socket`.
    FindUserSocketResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket_id: Option<Uuid>,
        success: bool,
    },

    /// A peer asked to open peer-to-peer connections.
    PeerConnectionRequest {
        socket_id: Uuid,
        payload: serde_json::Value,
    },

    /// Opaque peer-to-peer frame relayed from another connection.
    PeerSignal {
        socket_id: Uuid,
        payload: serde_json::Value,
    },

    /// Precondition, authorization, or lookup failure.
    Error { message: String },
}

impl ClientEvent {
    /// Wire name of this event, as carried in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinSession { .. } => "join-session",
            Self::LeaveSession { .. } => "leave-session",
            Self::CodeChange { .. } => "code-change",
            Self::WhiteboardDraw { .. } => "whiteboard-draw",
            Self::WhiteboardUpdate { .. } => "whiteboard-update",
            Self::WhiteboardClear => "whiteboard-clear",
            Self::WhiteboardRequestState { .. } => "whiteboard-request-state",
            Self::WhiteboardStateResponse { .. } => "whiteboard-state-response",
            Self::ChatMessage { .. } => "chat-message",
            Self::ChallengeSelected { .. } => "challenge-selected",
            Self::ChallengeClosed { .. } => "challenge-closed",
            Self::EndSession { .. } => "end-session",
            Self::ForceExitSession { .. } => "force-exit-session",
            Self::GetUsers { .. } => "get-users",
            Self::FindUserSocket { .. } => "find-user-socket",
            Self::RequestGlobalStats => "request-global-stats",
            Self::RequestPeerConnections { .. } => "request-peer-connections",
            Self::PeerSignal { .. } => "peer-signal",
        }
    }
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str::<ClientEvent>(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
