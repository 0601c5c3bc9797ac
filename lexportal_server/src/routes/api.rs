//! Public API routes sitting behind the abuse guard

use crate::routes::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use lexportal_common::{constants, ErrorBody};

/// Build the public API router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route(constants::HEALTH_PATH, get(health_check))
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "LexPortal API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "guard": state.guard.backend()
    }))
}

/// Fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("Not Found")))
}
