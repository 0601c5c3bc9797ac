//! Guard administration routes

use crate::abuse::ClientIdentity;
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use lexportal_common::ErrorBody;
use serde::Serialize;
use std::net::IpAddr;

/// Build the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/guard/stats", get(get_stats))
        .route("/api/v1/guard/bans/{ip}", delete(delete_ban))
}

/// Validate the bearer token; `Err` carries the response to send instead
fn validate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(admin_token) = state.config.admin_token.as_deref() else {
        return Err((StatusCode::NOT_FOUND, Json(ErrorBody::new("Not Found"))).into_response());
    };

    let authorized = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t == admin_token)
        .unwrap_or(false);

    if authorized {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(ErrorBody::new("Unauthorized"))).into_response())
    }
}

#[derive(Serialize)]
struct PolicyView {
    max_violations: u32,
    mode: &'static str,
    ban_seconds: u64,
    window_seconds: u64,
}

#[derive(Serialize)]
struct GuardStats {
    backend: &'static str,
    policy: PolicyView,
    tracked_identities: Option<usize>,
    banned_identities: Option<usize>,
}

#[derive(Serialize)]
struct UnbanResult {
    ip: String,
    cleared: bool,
}

fn store_failure(e: impl std::fmt::Display) -> Response {
    tracing::error!("Guard admin store failure: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new("Violation store unavailable")),
    )
        .into_response()
}

async fn get_stats(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = validate_admin(&state, &headers) {
        return response;
    }

    let stats = match state.guard.stats().await {
        Ok(stats) => stats,
        Err(e) => return store_failure(e),
    };

    let policy = state.guard.policy();
    Json(GuardStats {
        backend: state.guard.backend(),
        policy: PolicyView {
            max_violations: policy.max_violations,
            mode: policy.mode.as_str(),
            ban_seconds: policy.ban_duration.as_secs(),
            window_seconds: policy.window.as_secs(),
        },
        tracked_identities: stats.as_ref().map(|s| s.tracked_identities),
        banned_identities: stats.as_ref().map(|s| s.banned_identities),
    })
    .into_response()
}

async fn delete_ban(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> Response {
    if let Err(response) = validate_admin(&state, &headers) {
        return response;
    }

    let ip: IpAddr = match ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::new(format!("'{}' is not an IP address", ip))),
            )
                .into_response()
        }
    };

    match state.guard.unban(ClientIdentity::new(ip)).await {
        Ok(cleared) => Json(UnbanResult {
            ip: ip.to_string(),
            cleared,
        })
        .into_response(),
        Err(e) => store_failure(e),
    }
}
