//! Route handlers for the LexPortal server

pub mod admin;
pub mod api;

use crate::{
    abuse::{guard_middleware, AbuseGuard},
    config::Config,
};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub guard: AbuseGuard,
}

impl AppState {
    pub fn new(config: Config, guard: AbuseGuard) -> Self {
        Self {
            config: Arc::new(config),
            guard,
        }
    }
}

/// Build the main router with the abuse guard in front of every route
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .merge(admin::router())
        .fallback(api::not_found)
        .layer(middleware::from_fn_with_state(
            state.guard.clone(),
            guard_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
