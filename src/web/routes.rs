use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::static_files::static_handler;
use super::state::AppState;

// UI Routes - web interface
pub fn ui_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::ui::index_handler))
        .route("/static/{*path}", get(static_handler))
}

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Sessions
            .route("/sessions", post(handlers::api::create_session))
            .route("/sessions/{id}", get(handlers::api::get_session).delete(handlers::api::delete_session))
            .route("/sessions/{id}/query", post(handlers::api::query))
            .route("/sessions/{id}/reset", post(handlers::api::reset_session))
            .route("/sessions/{id}/role", put(handlers::api::change_role))
            .route("/sessions/{id}/stats", get(handlers::api::session_stats))
            .route("/sessions/{id}/history", get(handlers::api::session_history))

            // Schema metadata
            .route("/schema", get(handlers::api::get_schema))

            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(ui_routes())
        .merge(api_routes())
        .with_state(state)
}
