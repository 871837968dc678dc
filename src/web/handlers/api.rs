use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::memory::{ConversationTurn, MemoryStats};
use crate::agent::state::{QueryResponse, Role, UserContext};
use crate::auth::{authenticate, AuthError};
use crate::db::schema::SchemaMetadata;
use crate::web::state::{AppState, SharedSession};
use crate::web::templates::render_welcome;

// Session types

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub role: Role,
    pub owner_id: Option<i64>,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub user: UserContext,
    pub display_name: String,
    pub welcome: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub user: UserContext,
    pub memory: MemoryStats,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

// Query types

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub database_healthy: bool,
    pub llm: String,
    pub active_sessions: usize,
    pub table_count: usize,
}

fn login(state: &AppState, payload: &LoginRequest) -> Result<UserContext, (StatusCode, String)> {
    authenticate(payload.role, payload.owner_id, &payload.password, &state.config.auth).map_err(|e| match e {
        AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, e.to_string()),
        AuthError::InvalidContext(_) => (StatusCode::BAD_REQUEST, e.to_string()),
    })
}

async fn find_session(state: &AppState, id: &Uuid) -> Result<SharedSession, (StatusCode, String)> {
    state
        .session(id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Session '{}' not found", id)))
}

async fn session_info(state: &AppState, session: &SharedSession) -> SessionInfo {
    let session = session.lock().await;
    SessionInfo {
        session_id: session.id,
        user: session.user.clone(),
        display_name: session.user.display_name(),
        welcome: render_welcome(&state.template_env, &session.user),
        created_at: session.created_at,
    }
}

// API Implementations

pub async fn create_session(
    state: State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), (StatusCode, String)> {
    let user = login(&state, &payload)?;
    let (_, session) = state.create_session(user).await;
    Ok((StatusCode::CREATED, Json(session_info(&state, &session).await)))
}

pub async fn get_session(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = find_session(&state, &id).await?;
    Ok(Json(session_info(&state, &session).await))
}

pub async fn delete_session(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    if state.remove_session(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("Session '{}' not found", id)))
    }
}

pub async fn query(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let start_time = Instant::now();
    let session = find_session(&state, &id).await?;

    // Queries on the same session run one at a time
    let mut session = session.lock().await;
    let response = state.orchestrator.process(&mut session, &payload.question).await;

    info!(
        "Session {} query answered in {}ms ({:?})",
        id,
        start_time.elapsed().as_millis(),
        response.outcome
    );
    Ok(Json(response))
}

pub async fn reset_session(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let session = find_session(&state, &id).await?;
    session.lock().await.reset();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_role(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = find_session(&state, &id).await?;
    let user = login(&state, &payload).inspect_err(|_| {
        warn!("Rejected role change for session {}", id);
    })?;
    session.lock().await.change_role(user);
    Ok(Json(session_info(&state, &session).await))
}

pub async fn session_stats(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStats>, (StatusCode, String)> {
    let session = find_session(&state, &id).await?;
    let session = session.lock().await;
    Ok(Json(SessionStats {
        session_id: session.id,
        user: session.user.clone(),
        memory: session.memory.stats(),
        created_at: session.created_at,
        last_active: session.last_active,
    }))
}

pub async fn session_history(
    state: State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ConversationTurn>>, (StatusCode, String)> {
    let session = find_session(&state, &id).await?;
    let history = session.lock().await.memory.history();
    Ok(Json(history))
}

pub async fn get_schema(state: State<Arc<AppState>>) -> Json<SchemaMetadata> {
    Json(state.schema.clone())
}

pub async fn system_status(state: State<Arc<AppState>>) -> Json<SystemStatus> {
    let executor = state.executor.clone();
    let database_healthy = tokio::task::spawn_blocking(move || executor.is_healthy())
        .await
        .unwrap_or(false);

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (chrono::Utc::now() - state.startup_time).num_seconds(),
        database_healthy,
        llm: state.llm_description.clone(),
        active_sessions: state.session_count().await,
        table_count: state.schema.tables.len(),
    })
}
