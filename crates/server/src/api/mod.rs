// Session HTTP API.
//
// Thin CRUD surface over the session store: create (which mints the join
// code), lookup, code resolution, public listing, and the explicit
// participant join. Identity verification happens upstream; handlers accept
// the caller-supplied identity id.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use codehive_common::types::SessionRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, ServerError};
use crate::store::{SessionStore, StoreError, SESSION_CODE_LEN};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;
const MAX_TITLE_LEN: usize = 200;

#[derive(Clone)]
struct ApiState {
    store: SessionStore,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct JoinSessionRequest {
    pub user_id: String,
}

#[derive(Serialize, Deserialize)]
struct SessionEnvelope {
    session: SessionRecord,
}

#[derive(Serialize, Deserialize)]
struct SessionsPageEnvelope {
    items: Vec<SessionRecord>,
}

#[derive(Serialize, Deserialize)]
struct ResolvedCodeEnvelope {
    session_id: Uuid,
}

#[derive(Debug)]
enum ApiError {
    BadRequest { message: String },
    NotFound { message: &'static str },
    Internal(StoreError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::NotFound { message: "session does not exist" },
            other => Self::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                ServerError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::NotFound { message } => {
                ServerError::new(ErrorCode::NotFound, message).into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = %error, "session api internal error");
                ServerError::from_code(ErrorCode::InternalError).into_response()
            }
        }
    }
}

pub fn router(store: SessionStore) -> Router {
    let state = ApiState { store };
    Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/{id}", get(get_session))
        .route("/v1/sessions/{id}/join", post(join_session))
        .route("/v1/sessions/code/{code}", get(resolve_session_code))
        .with_state(state)
}

async fn create_session(
    State(state): State<ApiState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionEnvelope>), ApiError> {
    validate_required("title", &payload.title)?;
    validate_required("language", &payload.language)?;
    validate_required("created_by", &payload.created_by)?;
    if payload.title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::bad_request("title exceeds 200 characters"));
    }

    let session = state
        .store
        .create_session(crate::store::NewSession {
            title: payload.title.trim().to_string(),
            language: payload.language.trim().to_string(),
            description: payload.description.trim().to_string(),
            created_by: payload.created_by,
            is_public: payload.is_public,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(SessionEnvelope { session })))
}

async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionsPageEnvelope>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let items = state.store.list_public_sessions(limit).await?;
    Ok(Json(SessionsPageEnvelope { items }))
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionEnvelope>, ApiError> {
    let session = state
        .store
        .get_session(id)
        .await?
        .ok_or(ApiError::NotFound { message: "session does not exist" })?;
    Ok(Json(SessionEnvelope { session }))
}

async fn join_session(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<JoinSessionRequest>,
) -> Result<StatusCode, ApiError> {
    validate_required("user_id", &payload.user_id)?;
    state.store.add_participant(id, payload.user_id.trim()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_session_code(
    State(state): State<ApiState>,
    Path(code): Path<String>,
) -> Result<Json<ResolvedCodeEnvelope>, ApiError> {
    let trimmed = code.trim();
    if trimmed.len() != SESSION_CODE_LEN {
        return Err(ApiError::NotFound { message: "no active session with this code" });
    }

    let session_id = state
        .store
        .resolve_session_code(trimmed)
        .await?
        .ok_or(ApiError::NotFound { message: "no active session with this code" })?;
    Ok(Json(ResolvedCodeEnvelope { session_id }))
}

fn validate_required(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{field} must not be empty")));
    }
    Ok(())
}
