pub mod handler;

pub use handler::router;

use codehive_common::types::Identity;
use uuid::Uuid;

/// Per-connection state record, threaded through every handler call.
///
/// State machine: Unauthenticated -> Joined(session_id) -> Unauthenticated
/// (on leave or disconnect). `identity` is set only by `authenticate`;
/// `join-session` produces a Joined connection without an identity.
#[derive(Debug, Clone)]
pub struct ConnState {
    pub connection_id: Uuid,
    pub identity: Option<Identity>,
    pub session_id: Option<Uuid>,
}

impl ConnState {
    pub fn new(connection_id: Uuid) -> Self {
        Self { connection_id, identity: None, session_id: None }
    }
}
