// Session document store.
//
// Two backends behind one dispatch enum: Postgres for deployments, an
// in-memory store for development and tests. Every operation has a
// `_pg` / `_memory` implementation pair.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use codehive_common::types::{GlobalStats, SessionRecord, StatsSnapshot};
use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Alphabet for session codes: 32 symbols, visually ambiguous characters
/// (`0`, `O`, `1`, `I`) excluded.
pub const SESSION_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const SESSION_CODE_LEN: usize = 6;
/// Collision-retry budget for code generation.
const SESSION_CODE_MAX_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,
    #[error("could not allocate a unique session code")]
    CodeExhausted,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Input for session creation.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub title: String,
    pub language: String,
    pub description: String,
    pub created_by: String,
    pub is_public: bool,
}

#[derive(Clone)]
pub enum SessionStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryState>>),
}

#[derive(Default)]
pub struct MemoryState {
    sessions: HashMap<Uuid, SessionRecord>,
    stats: Option<GlobalStats>,
    stats_history: Vec<StatsSnapshot>,
}

impl SessionStore {
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryState::default())))
    }

    /// Create a session with a freshly generated session code, retrying on
    /// collision with codes of currently-active sessions.
    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        match self {
            Self::Postgres(pool) => create_session_pg(pool, new).await,
            Self::Memory(state) => create_session_memory(state, new).await,
        }
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => get_session_pg(pool, id).await,
            Self::Memory(state) => get_session_memory(state, id).await,
        }
    }

    /// Resolve a session code to the id of the active session carrying it.
    pub async fn resolve_session_code(&self, code: &str) -> Result<Option<Uuid>, StoreError> {
        let normalized = code.trim().to_ascii_uppercase();
        match self {
            Self::Postgres(pool) => resolve_session_code_pg(pool, &normalized).await,
            Self::Memory(state) => resolve_session_code_memory(state, &normalized).await,
        }
    }

    /// Active public sessions, newest first.
    pub async fn list_public_sessions(
        &self,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => list_public_sessions_pg(pool, limit).await,
            Self::Memory(state) => list_public_sessions_memory(state, limit).await,
        }
    }

    /// Append-only participant add. Presence churn never calls this; only
    /// the explicit join API does.
    pub async fn add_participant(
        &self,
        id: Uuid,
        identity_id: &str,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => add_participant_pg(pool, id, identity_id).await,
            Self::Memory(state) => add_participant_memory(state, id, identity_id).await,
        }
    }

    /// The debounced writer's target: one write of the latest code.
    pub async fn update_code(&self, id: Uuid, code: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => update_code_pg(pool, id, code).await,
            Self::Memory(state) => update_code_memory(state, id, code).await,
        }
    }

    pub async fn end_session(&self, id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => end_session_pg(pool, id).await,
            Self::Memory(state) => end_session_memory(state, id).await,
        }
    }

    pub async fn load_global_stats(&self) -> Result<Option<GlobalStats>, StoreError> {
        match self {
            Self::Postgres(pool) => load_global_stats_pg(pool).await,
            Self::Memory(state) => load_global_stats_memory(state).await,
        }
    }

    /// Merge-write of the platform counters. Presence-derived fields and
    /// the line-count watermark are replaced; `total_lines_of_code` is
    /// owned by [`SessionStore::increment_total_lines`] and only seeded
    /// when no stats document exists yet.
    pub async fn merge_global_stats(&self, stats: &GlobalStats) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => merge_global_stats_pg(pool, stats).await,
            Self::Memory(state) => merge_global_stats_memory(state, stats).await,
        }
    }

    /// Atomic read-modify-write increment of the persisted line total.
    pub async fn increment_total_lines(&self, delta: u64) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => increment_total_lines_pg(pool, delta).await,
            Self::Memory(state) => increment_total_lines_memory(state, delta).await,
        }
    }

    pub async fn append_stats_snapshot(
        &self,
        snapshot: &StatsSnapshot,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => append_stats_snapshot_pg(pool, snapshot).await,
            Self::Memory(state) => append_stats_snapshot_memory(state, snapshot).await,
        }
    }

    /// Dated snapshot history, oldest first.
    pub async fn stats_history(&self) -> Result<Vec<StatsSnapshot>, StoreError> {
        match self {
            Self::Postgres(pool) => stats_history_pg(pool).await,
            Self::Memory(state) => stats_history_memory(state).await,
        }
    }
}

pub fn generate_session_code() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_CODE_LEN)
        .map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char)
        .collect()
}

// ── Postgres implementations ─────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    title: String,
    language: String,
    description: String,
    code: String,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    participants: sqlx::types::Json<Vec<String>>,
    is_active: bool,
    is_public: bool,
    session_code: String,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            language: row.language,
            description: row.description,
            code: row.code,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            participants: row.participants.0,
            is_active: row.is_active,
            is_public: row.is_public,
            session_code: row.session_code,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    active_sessions: i64,
    collaborating_users: i64,
    total_lines_of_code: i64,
    last_updated: DateTime<Utc>,
    last_line_count: sqlx::types::Json<HashMap<Uuid, u64>>,
}

impl From<StatsRow> for GlobalStats {
    fn from(row: StatsRow) -> Self {
        Self {
            active_sessions: row.active_sessions.max(0) as u64,
            collaborating_users: row.collaborating_users.max(0) as u64,
            total_lines_of_code: row.total_lines_of_code.max(0) as u64,
            last_updated: Some(row.last_updated),
            last_line_count: row.last_line_count.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    captured_at: DateTime<Utc>,
    active_sessions: i64,
    collaborating_users: i64,
    total_lines_of_code: i64,
}

impl From<SnapshotRow> for StatsSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            timestamp: row.captured_at,
            active_sessions: row.active_sessions.max(0) as u64,
            collaborating_users: row.collaborating_users.max(0) as u64,
            total_lines_of_code: row.total_lines_of_code.max(0) as u64,
        }
    }
}

const SESSION_COLUMNS: &str = "id, title, language, description, code, created_by, created_at, \
     updated_at, participants, is_active, is_public, session_code";

async fn create_session_pg(pool: &PgPool, new: NewSession) -> Result<SessionRecord, StoreError> {
    for _ in 0..SESSION_CODE_MAX_ATTEMPTS {
        let session_code = generate_session_code();
        let inserted = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            INSERT INTO sessions (id, title, language, description, created_by, is_public, session_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SESSION_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(&new.title)
        .bind(&new.language)
        .bind(&new.description)
        .bind(&new.created_by)
        .bind(new.is_public)
        .bind(&session_code)
        .fetch_one(pool)
        .await;

        match inserted {
            Ok(row) => return Ok(row.into()),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Err(StoreError::CodeExhausted)
}

async fn get_session_pg(pool: &PgPool, id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1",
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(SessionRecord::from))
}

async fn resolve_session_code_pg(pool: &PgPool, code: &str) -> Result<Option<Uuid>, StoreError> {
    let id = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM sessions WHERE session_code = $1 AND is_active",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

async fn list_public_sessions_pg(
    pool: &PgPool,
    limit: usize,
) -> Result<Vec<SessionRecord>, StoreError> {
    let rows = sqlx::query_as::<_, SessionRow>(&format!(
        r#"
        SELECT {SESSION_COLUMNS}
        FROM sessions
        WHERE is_public AND is_active
        ORDER BY created_at DESC, id DESC
        LIMIT $1
        "#,
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(SessionRecord::from).collect())
}

async fn add_participant_pg(
    pool: &PgPool,
    id: Uuid,
    identity_id: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET participants = CASE
                WHEN participants ? $2 THEN participants
                ELSE participants || to_jsonb($2::text)
            END
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(identity_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

async fn update_code_pg(pool: &PgPool, id: Uuid, code: &str) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE sessions SET code = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(code)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

async fn end_session_pg(pool: &PgPool, id: Uuid) -> Result<(), StoreError> {
    let result =
        sqlx::query("UPDATE sessions SET is_active = FALSE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

async fn load_global_stats_pg(pool: &PgPool) -> Result<Option<GlobalStats>, StoreError> {
    let row = sqlx::query_as::<_, StatsRow>(
        r#"
        SELECT active_sessions, collaborating_users, total_lines_of_code,
               last_updated, last_line_count
        FROM platform_stats
        WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(GlobalStats::from))
}

async fn merge_global_stats_pg(pool: &PgPool, stats: &GlobalStats) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO platform_stats
            (id, active_sessions, collaborating_users, total_lines_of_code,
             last_updated, last_line_count)
        VALUES (1, $1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET active_sessions = EXCLUDED.active_sessions,
            collaborating_users = EXCLUDED.collaborating_users,
            last_updated = EXCLUDED.last_updated,
            last_line_count = EXCLUDED.last_line_count
        "#,
    )
    .bind(stats.active_sessions as i64)
    .bind(stats.collaborating_users as i64)
    .bind(stats.total_lines_of_code as i64)
    .bind(stats.last_updated.unwrap_or_else(Utc::now))
    .bind(sqlx::types::Json(&stats.last_line_count))
    .execute(pool)
    .await?;
    Ok(())
}

async fn increment_total_lines_pg(pool: &PgPool, delta: u64) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO platform_stats (id, total_lines_of_code, last_updated)
        VALUES (1, $1, now())
        ON CONFLICT (id) DO UPDATE
        SET total_lines_of_code = platform_stats.total_lines_of_code
            + EXCLUDED.total_lines_of_code
        "#,
    )
    .bind(delta as i64)
    .execute(pool)
    .await?;
    Ok(())
}

async fn append_stats_snapshot_pg(
    pool: &PgPool,
    snapshot: &StatsSnapshot,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO platform_stats_history
            (captured_at, active_sessions, collaborating_users, total_lines_of_code)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(snapshot.timestamp)
    .bind(snapshot.active_sessions as i64)
    .bind(snapshot.collaborating_users as i64)
    .bind(snapshot.total_lines_of_code as i64)
    .execute(pool)
    .await?;
    Ok(())
}

async fn stats_history_pg(pool: &PgPool) -> Result<Vec<StatsSnapshot>, StoreError> {
    let rows = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT captured_at, active_sessions, collaborating_users, total_lines_of_code
        FROM platform_stats_history
        ORDER BY captured_at ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(StatsSnapshot::from).collect())
}

// ── Memory implementations ───────────────────────────────────────────

async fn create_session_memory(
    state: &Arc<RwLock<MemoryState>>,
    new: NewSession,
) -> Result<SessionRecord, StoreError> {
    let mut guard = state.write().await;

    let mut session_code = None;
    for _ in 0..SESSION_CODE_MAX_ATTEMPTS {
        let candidate = generate_session_code();
        let taken = guard
            .sessions
            .values()
            .any(|session| session.is_active && session.session_code == candidate);
        if !taken {
            session_code = Some(candidate);
            break;
        }
    }
    let session_code = session_code.ok_or(StoreError::CodeExhausted)?;

    let now = Utc::now();
    let record = SessionRecord {
        id: Uuid::new_v4(),
        title: new.title,
        language: new.language,
        description: new.description,
        code: String::new(),
        created_by: new.created_by,
        created_at: now,
        updated_at: now,
        participants: Vec::new(),
        is_active: true,
        is_public: new.is_public,
        session_code,
    };
    guard.sessions.insert(record.id, record.clone());
    Ok(record)
}

async fn get_session_memory(
    state: &Arc<RwLock<MemoryState>>,
    id: Uuid,
) -> Result<Option<SessionRecord>, StoreError> {
    Ok(state.read().await.sessions.get(&id).cloned())
}

async fn resolve_session_code_memory(
    state: &Arc<RwLock<MemoryState>>,
    code: &str,
) -> Result<Option<Uuid>, StoreError> {
    let guard = state.read().await;
    Ok(guard
        .sessions
        .values()
        .find(|session| session.is_active && session.session_code == code)
        .map(|session| session.id))
}

async fn list_public_sessions_memory(
    state: &Arc<RwLock<MemoryState>>,
    limit: usize,
) -> Result<Vec<SessionRecord>, StoreError> {
    let guard = state.read().await;
    let mut sessions: Vec<SessionRecord> = guard
        .sessions
        .values()
        .filter(|session| session.is_public && session.is_active)
        .cloned()
        .collect();
    sessions.sort_by(|left, right| {
        right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
    });
    sessions.truncate(limit);
    Ok(sessions)
}

async fn add_participant_memory(
    state: &Arc<RwLock<MemoryState>>,
    id: Uuid,
    identity_id: &str,
) -> Result<(), StoreError> {
    let mut guard = state.write().await;
    let session = guard.sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
    if !session.participants.iter().any(|participant| participant == identity_id) {
        session.participants.push(identity_id.to_string());
    }
    Ok(())
}

async fn update_code_memory(
    state: &Arc<RwLock<MemoryState>>,
    id: Uuid,
    code: &str,
) -> Result<(), StoreError> {
    let mut guard = state.write().await;
    let session = guard.sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
    session.code = code.to_string();
    session.updated_at = Utc::now();
    Ok(())
}

async fn end_session_memory(
    state: &Arc<RwLock<MemoryState>>,
    id: Uuid,
) -> Result<(), StoreError> {
    let mut guard = state.write().await;
    let session = guard.sessions.get_mut(&id).ok_or(StoreError::NotFound)?;
    session.is_active = false;
    session.updated_at = Utc::now();
    Ok(())
}

async fn load_global_stats_memory(
    state: &Arc<RwLock<MemoryState>>,
) -> Result<Option<GlobalStats>, StoreError> {
    Ok(state.read().await.stats.clone())
}

async fn merge_global_stats_memory(
    state: &Arc<RwLock<MemoryState>>,
    stats: &GlobalStats,
) -> Result<(), StoreError> {
    let mut guard = state.write().await;
    match guard.stats.as_mut() {
        Some(existing) => {
            existing.active_sessions = stats.active_sessions;
            existing.collaborating_users = stats.collaborating_users;
            existing.last_updated = stats.last_updated;
            existing.last_line_count = stats.last_line_count.clone();
        }
        None => guard.stats = Some(stats.clone()),
    }
    Ok(())
}

async fn increment_total_lines_memory(
    state: &Arc<RwLock<MemoryState>>,
    delta: u64,
) -> Result<(), StoreError> {
    let mut guard = state.write().await;
    let stats = guard.stats.get_or_insert_with(GlobalStats::default);
    stats.total_lines_of_code += delta;
    Ok(())
}

async fn append_stats_snapshot_memory(
    state: &Arc<RwLock<MemoryState>>,
    snapshot: &StatsSnapshot,
) -> Result<(), StoreError> {
    state.write().await.stats_history.push(snapshot.clone());
    Ok(())
}

async fn stats_history_memory(
    state: &Arc<RwLock<MemoryState>>,
) -> Result<Vec<StatsSnapshot>, StoreError> {
    Ok(state.read().await.stats_history.clone())
}
