use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::ws_handler;
use crate::provision::create_project;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workspaces: String,
    pub terminals: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        workspaces: state.workspaces_root().display().to_string(),
        terminals: state.pty.len(),
    })
}

pub fn create_router(state: AppState) -> Router {
    // No authentication: any origin may connect.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/project", post(create_project))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
