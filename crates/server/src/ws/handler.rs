use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use codehive_common::protocol::events::{decode_client_event, encode_server_event, ClientEvent, ServerEvent};
use codehive_common::types::{Identity, PresenceUser};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ConnState;
use crate::coordinator::Coordinator;
use crate::metrics;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 262_144;

const ERR_NOT_JOINED: &str = "You must join a session first";

pub fn router(coordinator: Coordinator) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(coordinator)
}

async fn ws_upgrade(
    State(coordinator): State<Coordinator>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(coordinator, socket))
}

async fn handle_socket(coordinator: Coordinator, mut socket: WebSocket) {
    let mut state = ConnState::new(Uuid::new_v4());
    info!(connection_id = %state.connection_id, "websocket connection established");

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    coordinator.rooms.register(state.connection_id, outbound_sender).await;
    metrics::set_connected_connections(coordinator.rooms.connection_count().await as u64);

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout + std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS) {
                    warn!(connection_id = %state.connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_event) => {
                        if send_event(&mut socket, &outbound_event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match decode_client_event(&raw_message) {
                            Ok(event) => event,
                            Err(error) => {
                                debug!(
                                    connection_id = %state.connection_id,
                                    error = %error,
                                    "discarding undecodable frame"
                                );
                                if send_event(
                                    &mut socket,
                                    &ServerEvent::Error {
                                        message: "invalid event payload".to_string(),
                                    },
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };
                        dispatch(&coordinator, &mut state, inbound).await;
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    cleanup_connection(&coordinator, &state).await;
    info!(connection_id = %state.connection_id, "websocket connection terminated");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Route one inbound event through its handler. Handler failures become an
/// `error` event to the caller and never mutate state; a panic-free
/// handler per event keeps one connection's failure isolated from the
/// rest.
pub(crate) async fn dispatch(
    coordinator: &Coordinator,
    state: &mut ConnState,
    event: ClientEvent,
) {
    let event_name = event.name();
    let started_at = Instant::now();
    let result = route_event(coordinator, state, event).await;
    let is_error = result.is_err();
    if let Err(message) = result {
        coordinator
            .rooms
            .send_to(state.connection_id, ServerEvent::Error { message })
            .await;
    }
    metrics::record_ws_event(event_name, is_error, started_at.elapsed().as_millis() as u64);
}

async fn route_event(
    coordinator: &Coordinator,
    state: &mut ConnState,
    event: ClientEvent,
) -> Result<(), String> {
    match event {
        ClientEvent::Authenticate { session_id, user } => {
            handle_authenticate(coordinator, state, session_id, user).await
        }
        ClientEvent::JoinSession { session_id } => {
            handle_join_session(coordinator, state, session_id).await
        }
        ClientEvent::LeaveSession { session_id, user_id } => {
            handle_leave_session(coordinator, state, session_id, user_id).await
        }
        ClientEvent::CodeChange { content } => {
            handle_code_change(coordinator, state, content).await
        }
        ClientEvent::WhiteboardDraw { objects } => {
            handle_whiteboard_draw(coordinator, state, objects).await
        }
        ClientEvent::WhiteboardUpdate { object } => {
            handle_whiteboard_update(coordinator, state, object).await
        }
        ClientEvent::WhiteboardClear => handle_whiteboard_clear(coordinator, state).await,
        ClientEvent::WhiteboardRequestState { session_id } => {
            handle_whiteboard_request_state(coordinator, state, session_id).await
        }
        ClientEvent::WhiteboardStateResponse { session_id, objects, target_socket_id } => {
            handle_whiteboard_state_response(coordinator, state, session_id, objects, target_socket_id)
                .await
        }
        ClientEvent::ChatMessage { text } => handle_chat_message(coordinator, state, text).await,
        ClientEvent::ChallengeSelected { payload } => {
            let session_id = require_joined(state)?;
            coordinator
                .rooms
                .broadcast(
                    session_id,
                    ServerEvent::ChallengeSelected { payload },
                    Some(state.connection_id),
                )
                .await;
            Ok(())
        }
        ClientEvent::ChallengeClosed { payload } => {
            let session_id = require_joined(state)?;
            coordinator
                .rooms
                .broadcast(
                    session_id,
                    ServerEvent::ChallengeClosed { payload },
                    Some(state.connection_id),
                )
                .await;
            Ok(())
        }
        ClientEvent::EndSession { session_id, user_id } => {
            handle_end_session(coordinator, state, session_id, user_id).await
        }
        ClientEvent::ForceExitSession { session_id, message, ended_by } => {
            handle_force_exit_session(coordinator, state, session_id, message, ended_by).await
        }
        ClientEvent::GetUsers { session_id } => {
            handle_get_users(coordinator, state, session_id).await
        }
        ClientEvent::FindUserSocket { user_id } => {
            handle_find_user_socket(coordinator, state, user_id).await
        }
        ClientEvent::RequestGlobalStats => {
            // Available to every connection, joined or not.
            let stats = coordinator.stats.snapshot().await;
            coordinator
                .rooms
                .send_to(state.connection_id, ServerEvent::GlobalStats(stats))
                .await;
            Ok(())
        }
        ClientEvent::RequestPeerConnections { payload } => {
            let session_id = require_joined(state)?;
            coordinator
                .rooms
                .broadcast(
                    session_id,
                    ServerEvent::PeerConnectionRequest {
                        socket_id: state.connection_id,
                        payload,
                    },
                    Some(state.connection_id),
                )
                .await;
            Ok(())
        }
        ClientEvent::PeerSignal { target_socket_id, payload } => {
            require_joined(state)?;
            coordinator
                .rooms
                .send_to(
                    target_socket_id,
                    ServerEvent::PeerSignal { socket_id: state.connection_id, payload },
                )
                .await;
            Ok(())
        }
    }
}

fn require_joined(state: &ConnState) -> Result<Uuid, String> {
    state.session_id.ok_or_else(|| ERR_NOT_JOINED.to_string())
}

fn require_identity(state: &ConnState) -> Result<Identity, String> {
    state.identity.clone().ok_or_else(|| ERR_NOT_JOINED.to_string())
}

pub(crate) async fn handle_authenticate(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
    user: Identity,
) -> Result<(), String> {
    if user.id.trim().is_empty() {
        return Err("authenticate requires a sessionId and user".to_string());
    }

    // Throttled, not rejected: repeated attempts inside the cooldown are
    // dropped without an error event.
    if !coordinator
        .presence
        .begin_authenticate(&user.id, session_id, state.connection_id)
        .await
    {
        debug!(
            connection_id = %state.connection_id,
            session_id = %session_id,
            "authenticate throttled"
        );
        return Ok(());
    }

    let is_host = match coordinator.store.get_session(session_id).await {
        Ok(Some(session)) => session.created_by == user.id,
        Ok(None) => false,
        Err(error) => {
            warn!(session_id = %session_id, error = %error, "session lookup failed during authenticate");
            false
        }
    };

    coordinator.rooms.join(state.connection_id, session_id).await;
    let users = coordinator
        .presence
        .join(
            session_id,
            PresenceUser {
                id: user.id.clone(),
                display_name: user.display_name.clone(),
                avatar: user.avatar_url.clone(),
                socket_id: state.connection_id,
                is_active: true,
                is_host,
            },
        )
        .await;

    state.identity = Some(user);
    state.session_id = Some(session_id);

    coordinator
        .rooms
        .broadcast(session_id, ServerEvent::UsersUpdate { users: users.clone() }, None)
        .await;
    coordinator
        .rooms
        .send_to(state.connection_id, ServerEvent::JoinedSession { session_id, users })
        .await;
    Ok(())
}

pub(crate) async fn handle_join_session(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
) -> Result<(), String> {
    coordinator.rooms.join(state.connection_id, session_id).await;
    state.session_id = Some(session_id);
    coordinator
        .rooms
        .send_to(state.connection_id, ServerEvent::JoinedSessionRoom { session_id })
        .await;
    Ok(())
}

pub(crate) async fn handle_leave_session(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
    user_id: Option<String>,
) -> Result<(), String> {
    coordinator.rooms.leave(state.connection_id, session_id).await;
    let users = coordinator
        .presence
        .leave(session_id, user_id.as_deref().filter(|id| !id.is_empty()), state.connection_id)
        .await;
    coordinator.rooms.broadcast(session_id, ServerEvent::UsersUpdate { users }, None).await;

    if state.session_id == Some(session_id) {
        state.session_id = None;
        state.identity = None;
    }
    Ok(())
}

pub(crate) async fn handle_code_change(
    coordinator: &Coordinator,
    state: &mut ConnState,
    content: String,
) -> Result<(), String> {
    let session_id = require_joined(state)?;
    let user = state.identity.clone();

    let line_count = content.split('\n').count() as u64;
    if let Some(delta) = coordinator.stats.record_code_change(session_id, line_count).await {
        // Fire-and-forget: the persisted total self-heals via the atomic
        // increment on the next growth if this write is lost.
        if let Err(error) = coordinator.store.increment_total_lines(delta).await {
            warn!(session_id = %session_id, error = %error, "failed to persist line-count increment");
        }
    }

    coordinator
        .rooms
        .broadcast(
            session_id,
            ServerEvent::CodeUpdate { content: content.clone(), user },
            Some(state.connection_id),
        )
        .await;
    coordinator.saves.schedule(session_id, content);
    Ok(())
}

pub(crate) async fn handle_whiteboard_draw(
    coordinator: &Coordinator,
    state: &mut ConnState,
    objects: Vec<codehive_common::types::BoardObject>,
) -> Result<(), String> {
    let session_id = require_joined(state)?;
    let objects = coordinator.whiteboards.upsert_all(session_id, objects).await;
    coordinator
        .rooms
        .broadcast(session_id, ServerEvent::WhiteboardDraw { objects }, Some(state.connection_id))
        .await;
    Ok(())
}

pub(crate) async fn handle_whiteboard_update(
    coordinator: &Coordinator,
    state: &mut ConnState,
    object: codehive_common::types::BoardObject,
) -> Result<(), String> {
    let session_id = require_joined(state)?;
    let object = coordinator.whiteboards.upsert(session_id, object).await;
    coordinator
        .rooms
        .broadcast(session_id, ServerEvent::WhiteboardUpdate { object }, Some(state.connection_id))
        .await;
    Ok(())
}

pub(crate) async fn handle_whiteboard_clear(
    coordinator: &Coordinator,
    state: &mut ConnState,
) -> Result<(), String> {
    let session_id = require_joined(state)?;
    coordinator.whiteboards.clear(session_id).await;
    coordinator
        .rooms
        .broadcast(session_id, ServerEvent::WhiteboardClear, Some(state.connection_id))
        .await;
    Ok(())
}

pub(crate) async fn handle_whiteboard_request_state(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
) -> Result<(), String> {
    let joined = require_joined(state)?;
    if session_id != joined {
        return Err("whiteboard state request does not match the joined session".to_string());
    }

    let objects = coordinator.whiteboards.get(session_id).await;
    if !objects.is_empty() {
        coordinator
            .rooms
            .send_to(
                state.connection_id,
                ServerEvent::WhiteboardState {
                    session_id,
                    objects,
                    source: Some("server-stored".to_string()),
                },
            )
            .await;
    } else {
        // Nothing stored server-side: ask any peer to supply state.
        coordinator
            .rooms
            .broadcast(
                session_id,
                ServerEvent::WhiteboardStateRequest {
                    session_id,
                    requester_socket_id: state.connection_id,
                },
                Some(state.connection_id),
            )
            .await;
    }
    Ok(())
}

pub(crate) async fn handle_whiteboard_state_response(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
    objects: Vec<codehive_common::types::BoardObject>,
    target_socket_id: Uuid,
) -> Result<(), String> {
    let joined = require_joined(state)?;
    if session_id != joined {
        return Err("whiteboard state response does not match the joined session".to_string());
    }

    let objects = coordinator.whiteboards.upsert_all(session_id, objects).await;
    coordinator
        .rooms
        .send_to(
            target_socket_id,
            ServerEvent::WhiteboardState { session_id, objects, source: None },
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_chat_message(
    coordinator: &Coordinator,
    state: &mut ConnState,
    text: String,
) -> Result<(), String> {
    let session_id = require_joined(state)?;
    let user = require_identity(state)?;

    // Chat includes the sender so every client renders the same history.
    coordinator
        .rooms
        .broadcast(
            session_id,
            ServerEvent::ChatMessage { text, timestamp: Utc::now().timestamp_millis(), user },
            None,
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_end_session(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
    user_id: String,
) -> Result<(), String> {
    require_joined(state)?;

    let session = coordinator
        .store
        .get_session(session_id)
        .await
        .map_err(|error| {
            warn!(session_id = %session_id, error = %error, "session lookup failed during end-session");
            "failed to load session".to_string()
        })?
        .ok_or_else(|| "session not found".to_string())?;

    if session.created_by != user_id {
        return Err("only the session owner can end this session".to_string());
    }

    coordinator.store.end_session(session_id).await.map_err(|error| {
        warn!(session_id = %session_id, error = %error, "failed to mark session inactive");
        "failed to end session".to_string()
    })?;

    coordinator
        .rooms
        .broadcast(
            session_id,
            ServerEvent::SessionEnded {
                session_id,
                message: "This session has been ended by the host".to_string(),
                ended_by: user_id,
            },
            None,
        )
        .await;
    Ok(())
}

/// No server-side ownership check, unlike end-session: the caller is
/// trusted to have authorized this client-side. Kept as-is pending a
/// product decision on the asymmetry.
pub(crate) async fn handle_force_exit_session(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
    message: String,
    ended_by: String,
) -> Result<(), String> {
    require_joined(state)?;
    coordinator
        .rooms
        .broadcast(
            session_id,
            ServerEvent::ForceExitSession { session_id, message, ended_by },
            Some(state.connection_id),
        )
        .await;
    Ok(())
}

pub(crate) async fn handle_get_users(
    coordinator: &Coordinator,
    state: &mut ConnState,
    session_id: Uuid,
) -> Result<(), String> {
    require_joined(state)?;
    let users = coordinator.presence.users(session_id).await;

    // Answer the requester and resync the rest of the session.
    coordinator
        .rooms
        .send_to(state.connection_id, ServerEvent::UsersUpdate { users: users.clone() })
        .await;
    coordinator
        .rooms
        .broadcast(session_id, ServerEvent::UsersUpdate { users }, Some(state.connection_id))
        .await;
    Ok(())
}

pub(crate) async fn handle_find_user_socket(
    coordinator: &Coordinator,
    state: &mut ConnState,
    user_id: String,
) -> Result<(), String> {
    require_joined(state)?;
    let socket_id = coordinator.presence.find_user_socket(&user_id).await;
    coordinator
        .rooms
        .send_to(
            state.connection_id,
            ServerEvent::FindUserSocketResult { socket_id, success: socket_id.is_some() },
        )
        .await;
    Ok(())
}

/// Disconnect cleanup: same as leave, inferred from the connection's last
/// known session, but the membership pair survives while the identity has
/// another live connection in the session.
pub(crate) async fn cleanup_connection(coordinator: &Coordinator, state: &ConnState) {
    if let Some(session_id) = state.session_id {
        coordinator.rooms.leave(state.connection_id, session_id).await;
        if let Some(users) = coordinator.presence.disconnect(session_id, state.connection_id).await
        {
            coordinator
                .rooms
                .broadcast(session_id, ServerEvent::UsersUpdate { users }, None)
                .await;
        }
    }
    coordinator.rooms.unregister(state.connection_id).await;
    metrics::set_connected_connections(coordinator.rooms.connection_count().await as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsAggregator;
    use crate::store::{NewSession, SessionStore};
    use codehive_common::types::BoardObject;
    use serde_json::json;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            avatar_url: None,
        }
    }

    fn board_object(id: Option<&str>) -> BoardObject {
        let mut attrs = serde_json::Map::new();
        attrs.insert("x".to_string(), json!(1));
        BoardObject { id: id.map(ToOwned::to_owned), kind: "rect".to_string(), attrs }
    }

    async fn coordinator() -> Coordinator {
        let store = SessionStore::memory();
        let stats = StatsAggregator::load_baseline(&store).await;
        Coordinator::new(store, stats)
    }

    async fn create_session(coordinator: &Coordinator, created_by: &str) -> Uuid {
        coordinator
            .store
            .create_session(NewSession {
                title: "pairing".to_string(),
                language: "rust".to_string(),
                description: String::new(),
                created_by: created_by.to_string(),
                is_public: false,
            })
            .await
            .expect("session should be created")
            .id
    }

    async fn connect(
        coordinator: &Coordinator,
    ) -> (ConnState, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        coordinator.rooms.register(connection_id, sender).await;
        (ConnState::new(connection_id), receiver)
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    async fn authenticate(
        coordinator: &Coordinator,
        state: &mut ConnState,
        session_id: Uuid,
        user_id: &str,
    ) {
        dispatch(
            coordinator,
            state,
            ClientEvent::Authenticate { session_id, user: identity(user_id) },
        )
        .await;
    }

    // ── Authenticate ───────────────────────────────────────────────

    #[tokio::test]
    async fn authenticate_creates_presence_and_acks() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx) = connect(&coordinator).await;

        authenticate(&coordinator, &mut alice, session_id, "alice").await;

        assert_eq!(alice.session_id, Some(session_id));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::UsersUpdate { users } if users.len() == 1));
        let ServerEvent::JoinedSession { users, .. } = &events[1] else {
            panic!("expected a joined-session ack, got {:?}", events[1]);
        };
        assert_eq!(users[0].id, "alice");
        assert!(users[0].is_host, "the session creator should be flagged as host");
    }

    #[tokio::test]
    async fn authenticate_flags_non_creators_as_guests() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut bob, mut rx) = connect(&coordinator).await;

        authenticate(&coordinator, &mut bob, session_id, "bob").await;

        let events = drain(&mut rx);
        let ServerEvent::JoinedSession { users, .. } = &events[1] else {
            panic!("expected a joined-session ack");
        };
        assert!(!users[0].is_host);
    }

    #[tokio::test]
    async fn authenticate_with_blank_identity_errors_without_mutation() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut conn, mut rx) = connect(&coordinator).await;

        dispatch(
            &coordinator,
            &mut conn,
            ClientEvent::Authenticate {
                session_id,
                user: Identity {
                    id: "  ".to_string(),
                    display_name: "nobody".to_string(),
                    avatar_url: None,
                },
            },
        )
        .await;

        assert!(conn.session_id.is_none());
        assert!(coordinator.presence.users(session_id).await.is_empty());
        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn repeated_authenticate_is_throttled_silently() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx) = connect(&coordinator).await;

        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        drain(&mut rx);

        authenticate(&coordinator, &mut alice, session_id, "alice").await;

        // No error, no duplicate roster broadcast, still one entry.
        assert!(drain(&mut rx).is_empty());
        assert_eq!(coordinator.presence.users(session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn authenticate_announces_new_users_to_the_room() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, _rx_bob) = connect(&coordinator).await;

        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        drain(&mut rx_alice);

        authenticate(&coordinator, &mut bob, session_id, "bob").await;

        let events = drain(&mut rx_alice);
        let ServerEvent::UsersUpdate { users } = &events[0] else {
            panic!("expected a users-update broadcast");
        };
        assert_eq!(users.len(), 2);
    }

    // ── State machine guards ───────────────────────────────────────

    #[tokio::test]
    async fn joined_state_is_required_for_session_events() {
        let coordinator = coordinator().await;
        let (mut conn, mut rx) = connect(&coordinator).await;

        dispatch(&coordinator, &mut conn, ClientEvent::CodeChange { content: "x".into() }).await;
        dispatch(&coordinator, &mut conn, ClientEvent::ChatMessage { text: "hi".into() }).await;
        dispatch(
            &coordinator,
            &mut conn,
            ClientEvent::WhiteboardDraw { objects: vec![board_object(Some("1"))] },
        )
        .await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        for event in events {
            let ServerEvent::Error { message } = event else {
                panic!("expected an error event, got {event:?}");
            };
            assert_eq!(message, ERR_NOT_JOINED);
        }
        assert_eq!(coordinator.stats.snapshot().await.total_lines_of_code, 0);
    }

    #[tokio::test]
    async fn join_session_is_room_only() {
        let coordinator = coordinator().await;
        let session_id = Uuid::new_v4();
        let (mut conn, mut rx) = connect(&coordinator).await;

        dispatch(&coordinator, &mut conn, ClientEvent::JoinSession { session_id }).await;

        assert_eq!(conn.session_id, Some(session_id));
        assert!(conn.identity.is_none());
        assert!(coordinator.presence.users(session_id).await.is_empty());
        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::JoinedSessionRoom { session_id: sid } if sid == session_id));
    }

    // ── Code change (end-to-end fan-out) ───────────────────────────

    #[tokio::test]
    async fn code_change_broadcasts_to_peers_excluding_sender() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(&coordinator, &mut alice, ClientEvent::CodeChange { content: "x\ny".into() })
            .await;

        let bob_events = drain(&mut rx_bob);
        assert_eq!(bob_events.len(), 1);
        let ServerEvent::CodeUpdate { content, user } = &bob_events[0] else {
            panic!("expected a code-update");
        };
        assert_eq!(content, "x\ny");
        assert_eq!(user.as_ref().expect("sender identity should be attached").id, "alice");

        // Sender receives nothing back.
        assert!(drain(&mut rx_alice).is_empty());
        // One debounced save is pending with the latest content.
        assert_eq!(coordinator.saves.pending_count(), 1);
    }

    #[tokio::test]
    async fn code_change_updates_line_total_monotonically() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, _rx) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::CodeChange { content: "a\nb\nc".into() },
        )
        .await;
        dispatch(&coordinator, &mut alice, ClientEvent::CodeChange { content: "a".into() }).await;

        let stats = coordinator.stats.snapshot().await;
        assert_eq!(stats.total_lines_of_code, 3);

        // The persisted total advanced through the atomic increment too.
        let persisted = coordinator
            .store
            .load_global_stats()
            .await
            .expect("load should succeed")
            .expect("stats should exist");
        assert_eq!(persisted.total_lines_of_code, 3);
    }

    // ── Whiteboard ─────────────────────────────────────────────────

    #[tokio::test]
    async fn whiteboard_draw_assigns_ids_and_excludes_sender() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::WhiteboardDraw {
                objects: vec![board_object(Some("1")), board_object(None)],
            },
        )
        .await;

        let bob_events = drain(&mut rx_bob);
        let ServerEvent::WhiteboardDraw { objects } = &bob_events[0] else {
            panic!("expected a whiteboard-draw broadcast");
        };
        assert_eq!(objects.len(), 2);
        assert!(objects.iter().all(|object| object.id.is_some()));
        assert!(drain(&mut rx_alice).is_empty());
        assert_eq!(coordinator.whiteboards.get(session_id).await.len(), 2);
    }

    #[tokio::test]
    async fn stored_whiteboard_state_is_served_to_late_joiners() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, _rx_alice) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::WhiteboardDraw {
                objects: vec![board_object(Some("1")), board_object(Some("2"))],
            },
        )
        .await;

        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_bob);

        dispatch(&coordinator, &mut bob, ClientEvent::WhiteboardRequestState { session_id })
            .await;

        let events = drain(&mut rx_bob);
        let ServerEvent::WhiteboardState { objects, source, .. } = &events[0] else {
            panic!("expected whiteboard-state");
        };
        assert_eq!(objects.len(), 2);
        assert_eq!(source.as_deref(), Some("server-stored"));
    }

    #[tokio::test]
    async fn empty_whiteboard_request_asks_peers_and_response_is_forwarded() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(&coordinator, &mut bob, ClientEvent::WhiteboardRequestState { session_id })
            .await;

        // Nothing stored: the request is relayed to peers, not the caller.
        assert!(drain(&mut rx_bob).is_empty());
        let alice_events = drain(&mut rx_alice);
        let ServerEvent::WhiteboardStateRequest { requester_socket_id, .. } = &alice_events[0]
        else {
            panic!("expected a whiteboard-state-request relay");
        };
        assert_eq!(*requester_socket_id, bob.connection_id);

        // Alice supplies her local state for Bob only.
        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::WhiteboardStateResponse {
                session_id,
                objects: vec![board_object(Some("1"))],
                target_socket_id: bob.connection_id,
            },
        )
        .await;

        let bob_events = drain(&mut rx_bob);
        let ServerEvent::WhiteboardState { objects, source, .. } = &bob_events[0] else {
            panic!("expected whiteboard-state");
        };
        assert_eq!(objects.len(), 1);
        assert!(source.is_none());
        // The relayed objects are merged server-side for the next joiner.
        assert_eq!(coordinator.whiteboards.get(session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn whiteboard_request_for_another_session_is_rejected() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        drain(&mut rx);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::WhiteboardRequestState { session_id: Uuid::new_v4() },
        )
        .await;

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn whiteboard_clear_empties_the_board_for_the_session() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, _rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_bob);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::WhiteboardDraw { objects: vec![board_object(Some("1"))] },
        )
        .await;
        dispatch(&coordinator, &mut alice, ClientEvent::WhiteboardClear).await;

        assert!(coordinator.whiteboards.get(session_id).await.is_empty());
        let bob_events = drain(&mut rx_bob);
        assert!(matches!(bob_events.last(), Some(ServerEvent::WhiteboardClear)));
    }

    // ── Chat ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn chat_reaches_everyone_including_the_sender() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(&coordinator, &mut alice, ClientEvent::ChatMessage { text: "ship it".into() })
            .await;

        for receiver in [&mut rx_alice, &mut rx_bob] {
            let events = drain(receiver);
            let ServerEvent::ChatMessage { text, timestamp, user } = &events[0] else {
                panic!("expected a chat-message");
            };
            assert_eq!(text, "ship it");
            assert_eq!(user.id, "alice");
            assert!(*timestamp > 0);
        }
    }

    // ── End / force-exit ───────────────────────────────────────────

    #[tokio::test]
    async fn only_the_creator_can_end_a_session() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        // Bob is not the creator: error, session stays active.
        dispatch(
            &coordinator,
            &mut bob,
            ClientEvent::EndSession { session_id, user_id: "bob".into() },
        )
        .await;
        let bob_events = drain(&mut rx_bob);
        assert!(matches!(&bob_events[0], ServerEvent::Error { .. }));
        let session = coordinator
            .store
            .get_session(session_id)
            .await
            .expect("lookup should succeed")
            .expect("session should exist");
        assert!(session.is_active);

        // Alice ends it: everyone in the room is told.
        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::EndSession { session_id, user_id: "alice".into() },
        )
        .await;
        let session = coordinator
            .store
            .get_session(session_id)
            .await
            .expect("lookup should succeed")
            .expect("session should exist");
        assert!(!session.is_active);
        for receiver in [&mut rx_alice, &mut rx_bob] {
            let events = drain(receiver);
            assert!(matches!(&events[0], ServerEvent::SessionEnded { ended_by, .. } if ended_by == "alice"));
        }
    }

    #[tokio::test]
    async fn end_session_for_unknown_session_errors() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        drain(&mut rx);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::EndSession { session_id: Uuid::new_v4(), user_id: "alice".into() },
        )
        .await;

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::Error { message } if message == "session not found"));
    }

    #[tokio::test]
    async fn force_exit_broadcasts_without_an_ownership_check() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        // Bob is not the owner, but force-exit carries no server-side check.
        dispatch(
            &coordinator,
            &mut bob,
            ClientEvent::ForceExitSession {
                session_id,
                message: "time".into(),
                ended_by: "bob".into(),
            },
        )
        .await;

        let alice_events = drain(&mut rx_alice);
        assert!(matches!(&alice_events[0], ServerEvent::ForceExitSession { .. }));
        assert!(drain(&mut rx_bob).is_empty());
    }

    // ── Roster maintenance ─────────────────────────────────────────

    #[tokio::test]
    async fn leave_session_departs_the_roster() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, _rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);

        dispatch(
            &coordinator,
            &mut bob,
            ClientEvent::LeaveSession { session_id, user_id: Some("bob".into()) },
        )
        .await;

        assert!(bob.session_id.is_none());
        let users = coordinator.presence.users(session_id).await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "alice");

        let events = drain(&mut rx_alice);
        assert!(matches!(&events[0], ServerEvent::UsersUpdate { users } if users.len() == 1));
    }

    #[tokio::test]
    async fn disconnect_cleans_up_and_notifies_the_room() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, _rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);

        cleanup_connection(&coordinator, &bob).await;

        let users = coordinator.presence.users(session_id).await;
        assert_eq!(users.len(), 1);
        assert!(!coordinator.presence.is_member("bob", session_id).await);
        let events = drain(&mut rx_alice);
        assert!(matches!(&events[0], ServerEvent::UsersUpdate { users } if users.len() == 1));
        assert_eq!(coordinator.rooms.connection_count().await, 1);
    }

    // ── Lookups / stats / peer bootstrap ───────────────────────────

    #[tokio::test]
    async fn get_users_answers_and_rebroadcasts() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(&coordinator, &mut bob, ClientEvent::GetUsers { session_id }).await;

        let bob_events = drain(&mut rx_bob);
        assert!(matches!(&bob_events[0], ServerEvent::UsersUpdate { users } if users.len() == 2));
        let alice_events = drain(&mut rx_alice);
        assert!(matches!(&alice_events[0], ServerEvent::UsersUpdate { users } if users.len() == 2));
    }

    #[tokio::test]
    async fn find_user_socket_reports_hits_and_misses() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, _rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);

        dispatch(&coordinator, &mut alice, ClientEvent::FindUserSocket { user_id: "bob".into() })
            .await;
        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::FindUserSocket { user_id: "carol".into() },
        )
        .await;

        let events = drain(&mut rx_alice);
        assert!(matches!(
            &events[0],
            ServerEvent::FindUserSocketResult { socket_id: Some(id), success: true }
                if *id == bob.connection_id
        ));
        assert!(matches!(
            &events[1],
            ServerEvent::FindUserSocketResult { socket_id: None, success: false }
        ));
    }

    #[tokio::test]
    async fn global_stats_can_be_requested_without_joining() {
        let coordinator = coordinator().await;
        let (mut conn, mut rx) = connect(&coordinator).await;

        dispatch(&coordinator, &mut conn, ClientEvent::RequestGlobalStats).await;

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ServerEvent::GlobalStats(_)));
    }

    #[tokio::test]
    async fn peer_bootstrap_events_are_relayed_opaquely() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::RequestPeerConnections { payload: json!({"sdp": "offer"}) },
        )
        .await;

        let bob_events = drain(&mut rx_bob);
        let ServerEvent::PeerConnectionRequest { socket_id, payload } = &bob_events[0] else {
            panic!("expected a peer-connection-request");
        };
        assert_eq!(*socket_id, alice.connection_id);
        assert_eq!(payload["sdp"], "offer");
        assert!(drain(&mut rx_alice).is_empty());

        dispatch(
            &coordinator,
            &mut bob,
            ClientEvent::PeerSignal {
                target_socket_id: alice.connection_id,
                payload: json!({"ice": [1, 2]}),
            },
        )
        .await;

        let alice_events = drain(&mut rx_alice);
        let ServerEvent::PeerSignal { socket_id, payload } = &alice_events[0] else {
            panic!("expected a peer-signal");
        };
        assert_eq!(*socket_id, bob.connection_id);
        assert_eq!(payload["ice"][0], 1);
    }

    #[tokio::test]
    async fn challenge_events_pass_through_to_the_rest_of_the_room() {
        let coordinator = coordinator().await;
        let session_id = create_session(&coordinator, "alice").await;
        let (mut alice, mut rx_alice) = connect(&coordinator).await;
        let (mut bob, mut rx_bob) = connect(&coordinator).await;
        authenticate(&coordinator, &mut alice, session_id, "alice").await;
        authenticate(&coordinator, &mut bob, session_id, "bob").await;
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        dispatch(
            &coordinator,
            &mut alice,
            ClientEvent::ChallengeSelected { payload: json!({"id": "two-sum"}) },
        )
        .await;

        let bob_events = drain(&mut rx_bob);
        assert!(matches!(&bob_events[0], ServerEvent::ChallengeSelected { payload } if payload["id"] == "two-sum"));
        assert!(drain(&mut rx_alice).is_empty());
    }
}
