//! Control API: lifecycle operations, health, router and cache administration.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use self::auth::require_api_key;
use self::handlers::*;
use crate::http::server::AppState;

pub fn control_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/services", get(list_services))
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/startup", post(startup))
        .route("/shutdown", post(shutdown))
        .route("/restart", post(restart))
        .route("/router/metrics", get(router_metrics))
        .route("/router/strategy", put(set_strategy))
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/cache/warm", post(warm_cache))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}
